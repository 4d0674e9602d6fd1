pub mod ltir_utils;
pub mod registry;
pub mod spec;

pub use registry::{get_typed_backend, BackendRegistry, ErasedBackend};
pub use spec::{BackendError, BackendResult, PortableBackend};
