//! Placeholder fabrication for hermetic closure tracing.
//!
//! Closures are traced against throwaway tensors that mirror the shape and
//! dtype of the real loop inputs, so tracing never observes or mutates the
//! caller's data.

use crate::backend::spec::PortableBackend;
use crate::tensor::{DType, DeviceTensor, Tensor};

use super::error::{backend_error_from, LoopError, LoopErrorKind, Stage};

/// Builds one placeholder per input, preserving shape, dtype, and placement.
///
/// Floating point inputs get unit-normal noise so data-dependent closure bugs
/// surface during tracing; integer and boolean inputs get zeros.
pub(crate) fn make_placeholders<B: PortableBackend + 'static>(
    inputs: &[DeviceTensor<B>],
) -> Result<Vec<DeviceTensor<B>>, LoopError> {
    let mut rng = rand::thread_rng();
    let mut placeholders = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        let host = match input.dtype() {
            DType::F32 => Tensor::randn(input.shape().clone(), 1.0, &mut rng),
            DType::I32 => Tensor::zeros_i32(input.shape().clone()),
            DType::Bool => Tensor::zeros_bool(input.shape().clone()),
            other => {
                return Err(LoopError::precondition(
                    Stage::Probing,
                    format!("input {index} has no placeholder recipe for dtype {other:?}"),
                ));
            }
        };
        let placeholder = DeviceTensor::from_host(input.backend(), host).map_err(|err| {
            LoopError::new(
                Stage::Probing,
                LoopErrorKind::Execution {
                    source: backend_error_from(err),
                },
            )
        })?;
        placeholders.push(placeholder);
    }
    Ok(placeholders)
}
