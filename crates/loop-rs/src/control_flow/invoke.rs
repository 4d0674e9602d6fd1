//! Submission of assembled loop programs and unwrapping of their outputs.

use std::sync::Arc;
use std::time::Instant;

use crate::backend::spec::{BackendError, PortableBackend, Program};
use crate::ops::trace::{self, ProgramContext, ProgramKind, ProgramStats, ProgramStatus};
use crate::tensor::DeviceTensor;

use super::error::{backend_error_from, LoopError, LoopErrorKind, Stage};
use super::reconcile::CanonicalOrder;

/// Runs the assembled loop program once and rewraps the outputs as device
/// tensors.
///
/// The whole loop is a single backend submission: iteration happens inside
/// `run_program`, never on the host. Inputs are materialized in canonical slot
/// order and the returned vector is the carried values in caller order.
pub(crate) fn run_loop_program<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    program: &Program,
    order: CanonicalOrder,
    canonical_inputs: &[DeviceTensor<B>],
) -> Result<Vec<DeviceTensor<B>>, LoopError> {
    let input_refs: Vec<&DeviceTensor<B>> = canonical_inputs.iter().collect();
    let entry_inputs = DeviceTensor::materialize_many(&input_refs).map_err(|err| {
        LoopError::new(
            Stage::Executing,
            LoopErrorKind::Execution {
                source: backend_error_from(err),
            },
        )
    })?;

    let trace_sink = trace::current_sink();
    let trace_id = trace::next_trace_id();
    let entry_results = program
        .functions
        .first()
        .map(|function| function.result_ids.clone())
        .unwrap_or_default();
    let context = ProgramContext {
        trace_id,
        graph_id: None,
        backend: backend.backend_name().to_string(),
        targets: entry_results.clone(),
        outputs: entry_results,
        timestamp: std::time::SystemTime::now(),
        kind: ProgramKind::Loop {
            carried: order.carried(),
            additional: order.additional(),
        },
    };

    if let Some(ref sink) = trace_sink {
        sink.before_program(&context, program);
    }

    let start = Instant::now();
    match backend.run_program(program, &entry_inputs) {
        Ok(produced) => {
            if produced.len() != order.arity() {
                let message = format!(
                    "backend returned {} outputs, expected {}",
                    produced.len(),
                    order.arity()
                );
                if let Some(ref sink) = trace_sink {
                    sink.after_program(
                        &context,
                        &ProgramStats {
                            duration: start.elapsed(),
                            output_count: produced.len(),
                            status: ProgramStatus::Failure {
                                message: message.clone(),
                            },
                        },
                    );
                }
                return Err(LoopError::new(
                    Stage::Unwrapping,
                    LoopErrorKind::Execution {
                        source: BackendError::execution(message),
                    },
                ));
            }

            if let Some(ref sink) = trace_sink {
                sink.after_program(
                    &context,
                    &ProgramStats {
                        duration: start.elapsed(),
                        output_count: produced.len(),
                        status: ProgramStatus::Success,
                    },
                );
            }

            let wrapped: Vec<DeviceTensor<B>> = produced
                .into_iter()
                .zip(canonical_inputs)
                .map(|(handle, input)| {
                    DeviceTensor::from_handle(
                        Arc::clone(backend),
                        input.shape().clone(),
                        input.dtype(),
                        handle,
                    )
                })
                .collect();
            Ok(order.inverse_splice(&wrapped))
        }
        Err(err) => {
            if let Some(ref sink) = trace_sink {
                sink.after_program(
                    &context,
                    &ProgramStats {
                        duration: start.elapsed(),
                        output_count: 0,
                        status: ProgramStatus::Failure {
                            message: err.to_string(),
                        },
                    },
                );
            }
            Err(classify_backend_error(err))
        }
    }
}

/// Splits backend rejections from runtime faults so callers see the stage
/// that actually failed.
fn classify_backend_error(err: BackendError) -> LoopError {
    match err {
        BackendError::SpecViolation(_) | BackendError::Unimplemented { .. } => {
            LoopError::new(Stage::Compiling, LoopErrorKind::Compile { source: err })
        }
        BackendError::Execution { .. } => {
            LoopError::new(Stage::Executing, LoopErrorKind::Execution { source: err })
        }
    }
}
