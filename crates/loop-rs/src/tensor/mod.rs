//! Tensor types shared by every backend: host data, device handles, shapes,
//! and dtypes.
//!
//! [`DeviceTensorOps`] is re-exported here so the operator trait sits next to
//! the tensor types callers already have in scope.

mod device_tensor;
pub mod dtype;
mod host_tensor;
mod lazy_tensor;
pub mod shape;
pub(crate) mod spec_utils;

pub use crate::ops::functional::DeviceTensorOps;
pub use device_tensor::{DeviceTensor, IntoDeviceTensor, IntoDeviceTensorOption};
pub use dtype::DType;
pub use host_tensor::Tensor;
pub use lazy_tensor::InputRole;
pub(crate) use lazy_tensor::LazyHandle;
pub use shape::Shape;
