//! Device-side loops lowered from traced Rust closures.
//!
//! [`while_loop`] turns a pair of closures into a single `While` program: the
//! closures are traced once against placeholder tensors, the traces are
//! reconciled into cond/body regions over one loop-state tuple, and the whole
//! loop runs as one backend submission. [`fori_loop`] layers a derived
//! iteration counter on top of the same machinery.
//!
//! Every call re-traces and re-lowers from scratch. Closures are cheap to
//! trace (no device execution happens during tracing), and skipping a cache
//! means closures may capture different shapes or backends from call to call
//! without invalidation bugs.

mod assemble;
mod error;
mod invoke;
mod probe;
mod reconcile;
mod tracer;

use std::sync::Arc;

use crate::backend::spec::PortableBackend;
use crate::ops::functional::DeviceTensorOps;
use crate::tensor::{DType, DeviceTensor};

pub use error::{Callable, LoopError, LoopErrorKind, Stage};

/// Runs `body_fn` on the device while `cond_fn` holds.
///
/// `carried_inputs` is the loop state: the body receives the current carried
/// values and must return one new value per slot, each keeping its shape and
/// dtype. `additional_inputs` are read-only values (weights, constants) that
/// both closures may use but never update. Returns the final carried values
/// in the caller's order.
///
/// Both closures run once, against placeholder tensors, to record their
/// computation; they never see the real data. Everything a closure uses must
/// arrive through its arguments. A closure that touches other device tensors
/// it happened to capture fails with a [`LoopErrorKind::Reconciliation`]
/// error naming the strays.
///
/// # Limitations
///
/// The body cannot update state by mutating captured objects in place (for
/// example a layer that rewrites its own running statistics during the
/// forward pass). Tracing observes returned values only, so such updates
/// would be silently dropped; thread that state through `carried_inputs` and
/// return its new value instead.
pub fn while_loop<B, C, F>(
    cond_fn: C,
    body_fn: F,
    carried_inputs: &[DeviceTensor<B>],
    additional_inputs: &[DeviceTensor<B>],
) -> Result<Vec<DeviceTensor<B>>, LoopError>
where
    B: PortableBackend + 'static,
    C: FnMut(&[DeviceTensor<B>], &[DeviceTensor<B>]) -> anyhow::Result<DeviceTensor<B>>,
    F: FnMut(&[DeviceTensor<B>], &[DeviceTensor<B>]) -> anyhow::Result<Vec<DeviceTensor<B>>>,
{
    if carried_inputs.is_empty() {
        return Err(LoopError::precondition(
            Stage::Probing,
            "while_loop requires at least one carried value",
        ));
    }
    let backend = shared_backend(carried_inputs, additional_inputs)?;

    let carried_placeholders = probe::make_placeholders(carried_inputs)?;
    let additional_placeholders = probe::make_placeholders(additional_inputs)?;

    let reconciled = reconcile::reconcile_loop(
        Arc::clone(&backend),
        &carried_placeholders,
        &additional_placeholders,
        cond_fn,
        body_fn,
    )?;
    let program = assemble::assemble_program(&reconciled)?;

    let canonical_inputs = reconciled.order.splice(carried_inputs, additional_inputs);
    invoke::run_loop_program(&backend, &program, reconciled.order, &canonical_inputs)
}

/// Runs `body_fn` a fixed number of times determined by device-resident
/// bounds.
///
/// `upper` and `lower` must be `I32` tensors of shape `[1]`; the loop body
/// runs `upper - lower` times. The trip count lives on the device: the
/// bounds are read back once to validate them, then the countdown happens
/// inside the lowered loop as an extra carried slot that is stripped from
/// the results. Requires `upper >= lower`; a reversed range is an error
/// rather than a silent zero-trip loop. `upper == lower` runs zero
/// iterations and returns the carried values unchanged.
pub fn fori_loop<B, F>(
    upper: &DeviceTensor<B>,
    lower: &DeviceTensor<B>,
    body_fn: F,
    carried_inputs: &[DeviceTensor<B>],
) -> Result<Vec<DeviceTensor<B>>, LoopError>
where
    B: PortableBackend + 'static,
    F: FnMut(&[DeviceTensor<B>], &[DeviceTensor<B>]) -> anyhow::Result<Vec<DeviceTensor<B>>>,
{
    for (name, bound) in [("upper", upper), ("lower", lower)] {
        if bound.dtype() != DType::I32 || bound.shape().dims() != [1] {
            return Err(LoopError::precondition(
                Stage::Probing,
                format!(
                    "fori_loop {name} bound must be an I32 tensor of shape [1], got {:?} of shape {:?}",
                    bound.dtype(),
                    bound.shape().dims()
                ),
            ));
        }
    }

    let upper_value = read_scalar_i32("upper", upper)?;
    let lower_value = read_scalar_i32("lower", lower)?;
    if upper_value < lower_value {
        return Err(LoopError::precondition(
            Stage::Probing,
            format!(
                "fori_loop upper bound {upper_value} is less than lower bound {lower_value}"
            ),
        ));
    }

    let counter = upper.sub(lower).map_err(|err| {
        LoopError::precondition(
            Stage::Probing,
            format!("fori_loop could not form the iteration counter: {err:#}"),
        )
    })?;

    let mut inner_carried = Vec::with_capacity(carried_inputs.len() + 1);
    inner_carried.push(counter);
    inner_carried.extend(carried_inputs.iter().cloned());

    let cond = |carried: &[DeviceTensor<B>], _additional: &[DeviceTensor<B>]| {
        carried[0].gt_scalar(0.0)
    };
    let mut body_fn = body_fn;
    let body = move |carried: &[DeviceTensor<B>],
                     additional: &[DeviceTensor<B>]|
          -> anyhow::Result<Vec<DeviceTensor<B>>> {
        let next_counter = carried[0].sub_scalar(1.0)?;
        let user_results = body_fn(&carried[1..], additional)?;
        let mut results = Vec::with_capacity(user_results.len() + 1);
        results.push(next_counter);
        results.extend(user_results);
        Ok(results)
    };

    let results = while_loop(cond, body, &inner_carried, &[])?;
    Ok(results.into_iter().skip(1).collect())
}

fn shared_backend<B: PortableBackend + 'static>(
    carried: &[DeviceTensor<B>],
    additional: &[DeviceTensor<B>],
) -> Result<Arc<B>, LoopError> {
    let first = carried[0].backend();
    for tensor in carried.iter().chain(additional) {
        let other = tensor.backend();
        if !Arc::ptr_eq(&first, &other) {
            return Err(LoopError::precondition(
                Stage::Probing,
                format!(
                    "loop inputs must share one backend instance: {} vs {}",
                    first.backend_name(),
                    other.backend_name()
                ),
            ));
        }
    }
    Ok(first)
}

fn read_scalar_i32<B: PortableBackend + 'static>(
    name: &str,
    bound: &DeviceTensor<B>,
) -> Result<i32, LoopError> {
    let host = bound.to_host().map_err(|err| {
        LoopError::precondition(
            Stage::Probing,
            format!("fori_loop could not read the {name} bound: {err:#}"),
        )
    })?;
    Ok(host.data_i32()[0])
}
