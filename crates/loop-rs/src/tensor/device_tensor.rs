//! Backend-resident tensors: either a concrete handle or a deferred graph node.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};

use crate::backend::spec::{PortableBackend, TensorInit, TensorSpec, ValueId};
use crate::ops::graph::GraphArena;

use super::lazy_tensor::{InputRole, LazyHandle};
use super::shape::Shape;
use super::{spec_utils, DType, Tensor};

type DeferredGroup<B> = (Arc<GraphArena<B>>, Vec<(usize, ValueId)>);

// Args and params draw from separate identity spaces; graph imports key on
// (role, id) so the two must never collide.
static NEXT_ARG_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(1);

fn next_id(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A tensor living on a backend. The payload is a [`LazyHandle`]: uploaded
/// inputs hold their backend handle directly, while values produced by
/// functional ops point at a graph node that materializes on first use.
pub struct DeviceTensor<B: PortableBackend + 'static> {
    backend: Arc<B>,
    dtype: DType,
    shape: Shape,
    handle: Arc<LazyHandle<B>>,
}

impl<B: PortableBackend + 'static> Clone for DeviceTensor<B> {
    fn clone(&self) -> Self {
        DeviceTensor {
            backend: Arc::clone(&self.backend),
            dtype: self.dtype,
            shape: self.shape.clone(),
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<B: PortableBackend + 'static> DeviceTensor<B> {
    fn wrap_ready(backend: Arc<B>, shape: Shape, dtype: DType, handle: B::TensorHandle) -> Self {
        DeviceTensor {
            backend,
            dtype,
            shape,
            handle: Arc::new(LazyHandle::Ready {
                id: next_id(&NEXT_ARG_ID),
                role: InputRole::Arg,
                handle,
            }),
        }
    }

    /// Uploads a host tensor and wraps the resulting backend handle.
    pub fn from_host(backend: Arc<B>, tensor: Tensor) -> Result<Self> {
        let shape = tensor.shape().clone();
        let dtype = tensor.dtype();
        let handle = backend.materialize(TensorInit::Literal(tensor.to_literal()))?;
        Ok(Self::wrap_ready(backend, shape, dtype, handle))
    }

    /// Adopts an already-materialized backend handle under the given metadata.
    pub fn from_handle(
        backend: Arc<B>,
        shape: Shape,
        dtype: DType,
        handle: B::TensorHandle,
    ) -> Self {
        Self::wrap_ready(backend, shape, dtype, handle)
    }

    /// Wraps a recorded graph node. With `LOOPRS_EAGER` set the node is
    /// flushed immediately instead, except in capture-only arenas, which must
    /// stay unexecuted for tracing to remain hermetic.
    pub fn from_lazy(
        graph: Arc<GraphArena<B>>,
        shape: Shape,
        dtype: DType,
        value: ValueId,
    ) -> Result<Self> {
        if crate::env::eager_enabled() && !graph.is_capture_only() {
            let handle = graph.materialize(value)?;
            return Ok(Self::wrap_ready(graph.backend(), shape, dtype, handle));
        }
        Ok(DeviceTensor {
            backend: graph.backend(),
            dtype,
            shape,
            handle: Arc::new(LazyHandle::Deferred { graph, value }),
        })
    }

    /// Reads the tensor back to the host, materializing it first if needed.
    pub fn to_host(&self) -> Result<Tensor> {
        let literal = self.backend.to_literal(&self.materialize()?)?;
        Tensor::from_literal(&literal)
    }

    /// The backend this tensor is placed on.
    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    /// Logical shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Scalar element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Raw handle, for graph import paths.
    pub(crate) fn lazy_handle(&self) -> &Arc<LazyHandle<B>> {
        &self.handle
    }

    /// The arena that owns this tensor's pending node, if it has one.
    pub(crate) fn graph(&self) -> Option<Arc<GraphArena<B>>> {
        self.handle.graph()
    }

    /// Produces a concrete backend handle, executing pending graph work if the
    /// tensor is still lazy.
    pub fn materialize(&self) -> Result<B::TensorHandle> {
        match &*self.handle {
            LazyHandle::Ready { handle, .. } => Ok(handle.clone()),
            LazyHandle::Deferred { graph, value } => {
                if let Some(handle) = graph.try_ready_handle(*value) {
                    return Ok(handle);
                }
                graph
                    .materialize_values(&[*value])?
                    .pop()
                    .ok_or_else(|| anyhow!("failed to materialize value {:?}", value))
            }
        }
    }

    /// Re-tags the tensor as a parameter with a stable identity.
    ///
    /// Graph imports deduplicate by that identity, so a layer traced several
    /// times contributes one graph input per weight rather than one per trace.
    pub fn as_param(&self) -> Result<Self> {
        if let LazyHandle::Ready {
            role: InputRole::Param,
            ..
        } = &*self.handle
        {
            return Ok(self.clone());
        }
        let handle = self.materialize()?;
        Ok(DeviceTensor {
            backend: Arc::clone(&self.backend),
            dtype: self.dtype,
            shape: self.shape.clone(),
            handle: Arc::new(LazyHandle::Ready {
                id: next_id(&NEXT_PARAM_ID),
                role: InputRole::Param,
                handle,
            }),
        })
    }

    /// Materializes many tensors at once, batching those that share an arena
    /// into a single flush.
    pub fn materialize_many(tensors: &[&DeviceTensor<B>]) -> Result<Vec<B::TensorHandle>> {
        let mut resolved: Vec<Option<B::TensorHandle>> = vec![None; tensors.len()];
        let mut pending: HashMap<usize, DeferredGroup<B>> = HashMap::new();

        for (position, tensor) in tensors.iter().enumerate() {
            match &*tensor.handle {
                LazyHandle::Ready { handle, .. } => resolved[position] = Some(handle.clone()),
                LazyHandle::Deferred { graph, value } => pending
                    .entry(Arc::as_ptr(graph) as usize)
                    .or_insert_with(|| (Arc::clone(graph), Vec::new()))
                    .1
                    .push((position, *value)),
            }
        }

        for (graph, entries) in pending.into_values() {
            let wanted: Vec<ValueId> = entries.iter().map(|(_, value)| *value).collect();
            let handles = graph.materialize_values(&wanted)?;
            for ((position, _), handle) in entries.into_iter().zip(handles) {
                resolved[position] = Some(handle);
            }
        }

        Ok(resolved
            .into_iter()
            .map(|slot| slot.expect("failed to materialize tensor"))
            .collect())
    }

    /// The backend-facing spec (dtype + static shape) for this tensor.
    pub(crate) fn tensor_spec(&self) -> TensorSpec {
        TensorSpec::new(
            spec_utils::backend_dtype(self.dtype),
            spec_utils::backend_shape_from_shape(&self.shape),
        )
    }
}

impl<B: PortableBackend + 'static> AsRef<DeviceTensor<B>> for DeviceTensor<B> {
    fn as_ref(&self) -> &DeviceTensor<B> {
        self
    }
}

impl<B: PortableBackend> fmt::Debug for DeviceTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.handle {
            LazyHandle::Ready { .. } => "ready",
            LazyHandle::Deferred { .. } => "deferred",
        };
        f.debug_struct("DeviceTensor")
            .field("backend", &self.backend.backend_name())
            .field("dtype", &self.dtype)
            .field("shape", &self.shape.dims())
            .field("state", &state)
            .finish()
    }
}

/// Anything that can be placed on a backend as a device tensor.
pub trait IntoDeviceTensor<B: PortableBackend + 'static> {
    /// Places the value on `backend`.
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>>;
}

impl<B: PortableBackend + 'static> IntoDeviceTensor<B> for Tensor {
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>> {
        DeviceTensor::from_host(Arc::clone(backend), self)
    }
}

impl<B, T> IntoDeviceTensor<B> for T
where
    B: PortableBackend + 'static,
    T: AsRef<DeviceTensor<B>>,
{
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>> {
        let tensor = self.as_ref();
        ensure!(
            Arc::ptr_eq(&tensor.backend, backend),
            "tensor belongs to a different backend instance"
        );
        Ok(tensor.clone())
    }
}

/// Lifts [`IntoDeviceTensor`] over `Option`, used for optional layer biases.
pub trait IntoDeviceTensorOption<B: PortableBackend + 'static> {
    /// Places the contained value on `backend` when present.
    fn into_device_tensor_option(self, backend: &Arc<B>) -> Result<Option<DeviceTensor<B>>>;
}

impl<B, T> IntoDeviceTensorOption<B> for Option<T>
where
    B: PortableBackend + 'static,
    T: IntoDeviceTensor<B>,
{
    fn into_device_tensor_option(self, backend: &Arc<B>) -> Result<Option<DeviceTensor<B>>> {
        self.map(|value| value.into_device_tensor(backend)).transpose()
    }
}
