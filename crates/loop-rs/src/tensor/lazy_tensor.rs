//! The deferred-or-ready payload behind every device tensor.

use crate::backend::spec::{PortableBackend, ValueId};
use crate::ops::graph::GraphArena;
use std::sync::Arc;

/// How an uploaded tensor participates in graph import deduplication.
///
/// `Arg` inputs are ordinary data. `Param` marks weights: imports of the same
/// `Param` identity collapse to a single graph parameter across traces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputRole {
    Arg,
    Param,
}

/// Payload of a [`DeviceTensor`](super::DeviceTensor).
pub(crate) enum LazyHandle<B: PortableBackend + 'static> {
    /// Already on the backend; carries a stable identity for import dedupe.
    Ready {
        id: u64,
        role: InputRole,
        handle: B::TensorHandle,
    },
    /// Still a graph node; executing `graph` up to `value` produces it.
    Deferred {
        graph: Arc<GraphArena<B>>,
        value: ValueId,
    },
}

impl<B: PortableBackend + 'static> LazyHandle<B> {
    /// The arena this handle is deferred on, or `None` once ready.
    pub fn graph(&self) -> Option<Arc<GraphArena<B>>> {
        match self {
            LazyHandle::Ready { .. } => None,
            LazyHandle::Deferred { graph, .. } => Some(Arc::clone(graph)),
        }
    }
}
