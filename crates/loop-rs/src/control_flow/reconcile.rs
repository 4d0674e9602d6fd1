//! Canonical ordering and signature reconciliation for traced loop regions.
//!
//! A lowered `While` carries one tuple of loop state. [`CanonicalOrder`] is
//! the single definition of how caller-facing carried and additional lists
//! map onto that tuple's slots; every other pipeline stage goes through its
//! `splice`/`inverse_splice` instead of reimplementing the arithmetic.

use std::ops::Range;
use std::sync::Arc;

use crate::backend::ltir_utils::tensor_spec_static;
use crate::backend::spec::{DType, PortableBackend, Region, RegionId, TensorSpec};
use crate::ops::functional::tensor_spec_from_device;
use crate::tensor::DeviceTensor;

use super::error::{Callable, LoopError};
use super::tracer::{trace_callable, TracedCallable};

/// Positional layout of loop state inside the lowered `While` tuple.
///
/// Canonical slot order is: the first carried value, then every additional
/// value, then the remaining carried values. Carried slots are mutable across
/// iterations; additional slots pass through each iteration untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CanonicalOrder {
    carried: usize,
    additional: usize,
}

impl CanonicalOrder {
    pub(crate) fn new(carried: usize, additional: usize) -> Self {
        debug_assert!(carried >= 1, "loops carry at least one value");
        Self {
            carried,
            additional,
        }
    }

    pub(crate) fn carried(&self) -> usize {
        self.carried
    }

    pub(crate) fn additional(&self) -> usize {
        self.additional
    }

    /// Total number of tuple slots.
    pub(crate) fn arity(&self) -> usize {
        self.carried + self.additional
    }

    /// Canonical slot range occupied by the additional values.
    pub(crate) fn additional_positions(&self) -> Range<usize> {
        1..1 + self.additional
    }

    /// Lays caller-order carried and additional values out in slot order.
    pub(crate) fn splice<T: Clone>(&self, carried: &[T], additional: &[T]) -> Vec<T> {
        debug_assert_eq!(carried.len(), self.carried);
        debug_assert_eq!(additional.len(), self.additional);
        let mut slots = Vec::with_capacity(self.arity());
        slots.push(carried[0].clone());
        slots.extend(additional.iter().cloned());
        slots.extend(carried[1..].iter().cloned());
        slots
    }

    /// Recovers the carried values, in caller order, from slot order.
    pub(crate) fn inverse_splice<T: Clone>(&self, slots: &[T]) -> Vec<T> {
        debug_assert_eq!(slots.len(), self.arity());
        let mut carried = Vec::with_capacity(self.carried);
        carried.push(slots[0].clone());
        carried.extend(slots[1 + self.additional..].iter().cloned());
        carried
    }
}

/// Traced loop signature agreed between both closures, ready for assembly.
pub(crate) struct ReconciledLoop {
    pub(crate) order: CanonicalOrder,
    pub(crate) operand_specs: Vec<TensorSpec>,
    pub(crate) cond_region: Region,
    pub(crate) body_region: Region,
}

/// Traces both closures against the placeholders and checks that the captured
/// graphs agree with the declared loop signature.
///
/// Closures see carried and additional values in caller order; the canonical
/// reshuffle happens here, on both the way in (placeholder layout) and the way
/// out (body results plus pass-through additional slots).
pub(crate) fn reconcile_loop<B, C, F>(
    backend: Arc<B>,
    carried_placeholders: &[DeviceTensor<B>],
    additional_placeholders: &[DeviceTensor<B>],
    mut cond_fn: C,
    mut body_fn: F,
) -> Result<ReconciledLoop, LoopError>
where
    B: PortableBackend + 'static,
    C: FnMut(&[DeviceTensor<B>], &[DeviceTensor<B>]) -> anyhow::Result<DeviceTensor<B>>,
    F: FnMut(&[DeviceTensor<B>], &[DeviceTensor<B>]) -> anyhow::Result<Vec<DeviceTensor<B>>>,
{
    let order = CanonicalOrder::new(carried_placeholders.len(), additional_placeholders.len());
    let canonical_placeholders = order.splice(carried_placeholders, additional_placeholders);
    let operand_specs: Vec<TensorSpec> = canonical_placeholders
        .iter()
        .map(tensor_spec_from_device)
        .collect();

    let cond = trace_callable(
        Arc::clone(&backend),
        Callable::Cond,
        &canonical_placeholders,
        |canonical| {
            let carried_view = order.inverse_splice(canonical);
            let additional_view = &canonical[order.additional_positions()];
            let predicate = cond_fn(&carried_view, additional_view)?;
            Ok(vec![predicate])
        },
    )?;
    audit_captures(Callable::Cond, &cond, order.arity())?;

    let predicate_spec = tensor_spec_static(DType::I1, &[1]);
    let cond_result_spec = spec_for(&cond, cond.result_ids[0], "cond result")?;
    if cond_result_spec != predicate_spec {
        return Err(LoopError::reconciliation(format!(
            "cond must return a single {predicate_spec:?} predicate, got {cond_result_spec:?}"
        )));
    }

    let body = trace_callable(
        Arc::clone(&backend),
        Callable::Body,
        &canonical_placeholders,
        |canonical| {
            let carried_view = order.inverse_splice(canonical);
            let additional_view = &canonical[order.additional_positions()];
            body_fn(&carried_view, additional_view)
        },
    )?;
    if body.result_ids.len() != order.carried() {
        return Err(LoopError::reconciliation(format!(
            "body must return {} carried value(s), got {}",
            order.carried(),
            body.result_ids.len()
        )));
    }
    audit_captures(Callable::Body, &body, order.arity())?;

    // Additional slots feed through each iteration unchanged, so the body
    // region forwards its own parameters for them.
    let additional_param_ids = body.parameter_ids[order.additional_positions()].to_vec();
    let canonical_result_ids = order.splice(&body.result_ids, &additional_param_ids);
    for (slot, (value, expected)) in canonical_result_ids
        .iter()
        .zip(&operand_specs)
        .enumerate()
    {
        let actual = spec_for(&body, *value, "body result")?;
        if actual != *expected {
            return Err(LoopError::reconciliation(format!(
                "body result for slot {slot} must keep spec {expected:?}, got {actual:?}"
            )));
        }
    }

    let cond_region = cond
        .arena
        .lower_region(RegionId(0), &cond.parameter_ids, &cond.result_ids)
        .map_err(|err| LoopError::reconciliation(format!("{err:#}")))?;
    let body_region = body
        .arena
        .lower_region(RegionId(1), &body.parameter_ids, &canonical_result_ids)
        .map_err(|err| LoopError::reconciliation(format!("{err:#}")))?;

    Ok(ReconciledLoop {
        order,
        operand_specs,
        cond_region,
        body_region,
    })
}

/// Rejects closures whose trace pulled in tensors beyond the declared lists.
///
/// Placeholders are imported first, so any parameter past the declared count
/// is a closure capture of outside state. Those have no slot in the loop
/// tuple, and hoisting them silently would change the call's meaning.
fn audit_captures<B: PortableBackend + 'static>(
    callable: Callable,
    traced: &TracedCallable<B>,
    declared: usize,
) -> Result<(), LoopError> {
    let parameters = traced.arena.imported_parameters();
    if parameters.len() > declared {
        let extras: Vec<String> = parameters[declared..]
            .iter()
            .map(|(value, spec)| format!("{value:?} ({spec:?})"))
            .collect();
        return Err(LoopError::reconciliation(format!(
            "{callable} closure captured {} tensor(s) outside the declared carried/additional lists: {}; pass them via additional_inputs instead",
            parameters.len() - declared,
            extras.join(", ")
        )));
    }
    Ok(())
}

fn spec_for<B: PortableBackend + 'static>(
    traced: &TracedCallable<B>,
    value: crate::backend::spec::ValueId,
    what: &str,
) -> Result<TensorSpec, LoopError> {
    traced.arena.tensor_spec_for(value).ok_or_else(|| {
        LoopError::reconciliation(format!("{what} {value:?} has no recorded tensor spec"))
    })
}
