//! Backend-agnostic functional operators over device tensors.
//!
//! Everything here records graph nodes instead of computing values. The free
//! functions and the [`DeviceTensorOps`] extension trait are the surface the
//! layer and loop code build on.

use std::sync::Arc;

use crate::backend::spec::{PortableBackend, TensorSpec};
use crate::ops::graph::GraphArena;
use crate::tensor::{spec_utils, DeviceTensor};

pub(crate) mod common;
pub mod linalg;
pub mod tensor_ops;

pub use common::{CaptureIntoDeviceTensor, DeviceTensorOps};
pub use linalg::*;
pub use tensor_ops::*;

/// The backend-level spec describing `tensor`'s dtype and shape.
pub fn tensor_spec_from_device<B: PortableBackend + 'static>(
    tensor: &DeviceTensor<B>,
) -> TensorSpec {
    TensorSpec::new(
        spec_utils::backend_dtype(tensor.dtype()),
        spec_utils::backend_shape_from_shape(tensor.shape()),
    )
}

/// First arena any of `tensors` is deferred on, if one is still lazy.
pub fn resolve_graph_from_tensors<B: PortableBackend + 'static>(
    tensors: &[&DeviceTensor<B>],
) -> Option<Arc<GraphArena<B>>> {
    tensors.iter().find_map(|tensor| tensor.graph())
}
