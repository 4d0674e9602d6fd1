extern crate self as loop_rs;

pub mod backend;
pub mod control_flow;
pub mod nn;
pub mod ops;
pub mod tensor;
pub use tensor::DeviceTensor;
mod env;

pub use backend::spec::PortableBackend;
pub use control_flow::{fori_loop, while_loop, LoopError};
pub use tensor::{DType, Shape, Tensor};
