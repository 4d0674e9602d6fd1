//! Hermetic tracing of loop closures into capture-only arenas.

use std::sync::Arc;

use anyhow::anyhow;

use crate::backend::spec::{PortableBackend, ValueId};
use crate::ops::graph::{context, GraphArena};
use crate::tensor::{DeviceTensor, LazyHandle};

use super::error::{Callable, LoopError, LoopErrorKind, Stage};

/// Raw capture of one closure: the arena holding its recorded nodes plus the
/// value ids of its entry parameters and returned results, in call order.
pub(crate) struct TracedCallable<B: PortableBackend + 'static> {
    pub(crate) arena: Arc<GraphArena<B>>,
    pub(crate) parameter_ids: Vec<ValueId>,
    pub(crate) result_ids: Vec<ValueId>,
}

fn stage_for(callable: Callable) -> Stage {
    match callable {
        Callable::Cond => Stage::TracingCond,
        Callable::Body => Stage::TracingBody,
    }
}

fn tracing_error(callable: Callable, source: anyhow::Error) -> LoopError {
    LoopError::new(
        stage_for(callable),
        LoopErrorKind::Tracing { callable, source },
    )
}

/// Runs `f` against the placeholder tensors inside a fresh capture-only arena
/// and returns the recorded graph.
///
/// Nothing executes on the backend while `f` runs: the arena refuses
/// materialization, so a closure that forces a read-back fails here with a
/// tracing error instead of silently launching device work. Placeholders are
/// imported up front so parameter ids come out dense and in declaration order.
pub(crate) fn trace_callable<B, F>(
    backend: Arc<B>,
    callable: Callable,
    placeholders: &[DeviceTensor<B>],
    f: F,
) -> Result<TracedCallable<B>, LoopError>
where
    B: PortableBackend + 'static,
    F: FnOnce(&[DeviceTensor<B>]) -> anyhow::Result<Vec<DeviceTensor<B>>>,
{
    let arena = GraphArena::capture_only(backend);

    let parameter_ids = arena
        .capture(|ctx| {
            let mut ids = Vec::with_capacity(placeholders.len());
            for placeholder in placeholders {
                ids.push(ctx.import(placeholder)?);
            }
            Ok(ids)
        })
        .map_err(|err| tracing_error(callable, err))?;

    let mut traced_inputs = Vec::with_capacity(placeholders.len());
    for (placeholder, value) in placeholders.iter().zip(&parameter_ids) {
        let traced = DeviceTensor::from_lazy(
            Arc::clone(&arena),
            placeholder.shape().clone(),
            placeholder.dtype(),
            *value,
        )
        .map_err(|err| tracing_error(callable, err))?;
        traced_inputs.push(traced);
    }

    let results = context::with_default_arena(Arc::clone(&arena), || f(&traced_inputs))
        .map_err(|err| tracing_error(callable, err))?;

    let mut result_ids = Vec::with_capacity(results.len());
    for (index, result) in results.iter().enumerate() {
        let value = match &**result.lazy_handle() {
            LazyHandle::Deferred { graph, value } if Arc::ptr_eq(graph, &arena) => *value,
            LazyHandle::Deferred { .. } => {
                return Err(tracing_error(
                    callable,
                    anyhow!("result {index} was recorded in a different graph arena"),
                ));
            }
            // A materialized tensor flowing straight through (or smuggled in
            // from outside) becomes an imported parameter; the reconciler
            // decides whether the signature allows it.
            LazyHandle::Ready { .. } => arena
                .capture(|ctx| ctx.import(result))
                .map_err(|err| tracing_error(callable, err))?,
        };
        result_ids.push(value);
    }

    Ok(TracedCallable {
        arena,
        parameter_ids,
        result_ids,
    })
}
