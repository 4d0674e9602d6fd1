//! Shape-aware conveniences layered over the elementwise primitives.

use anyhow::Result;

use crate::backend::ltir_utils;
use crate::backend::spec::{
    BroadcastToSpec, ElementwiseBinaryOp, Operand, Operation, PortableBackend,
};
use crate::ops::functional::common::{
    capture_with_inputs, ensure_last_dim, ensure_rank, ensure_rank_at_least, ensure_same_backend,
    ensure_same_dtype, CaptureIntoDeviceTensor,
};
use crate::tensor::spec_utils::backend_dtype;
use crate::tensor::DeviceTensor;

/// Checks `bias` is a vector matching the trailing dimension of `x` and
/// returns the output shape.
fn validate_add_bias<B: PortableBackend + 'static>(
    x: &DeviceTensor<B>,
    bias: &DeviceTensor<B>,
) -> Result<Vec<usize>> {
    ensure_same_backend("add_bias", x, bias)?;
    ensure_same_dtype("add_bias input", x, "bias", bias)?;
    ensure_rank_at_least("add_bias input", x, 1)?;
    ensure_rank("add_bias bias", bias, 1)?;
    let dims = x.shape().dims();
    ensure_last_dim("add_bias bias", bias, dims[dims.len() - 1])?;
    Ok(dims.to_vec())
}

/// Adds a bias vector to the last dimension of `x`.
///
/// The bias is broadcast across every leading axis before the add, so the
/// result keeps the shape of `x`.
pub fn add_bias<B: PortableBackend + 'static>(
    x: &DeviceTensor<B>,
    bias: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let output_shape = validate_add_bias(x, bias)?;
    let out_spec = ltir_utils::tensor_spec_static(backend_dtype(x.dtype()), &output_shape);
    let broadcast_spec = out_spec.clone();
    capture_with_inputs(&[x, bias], |ctx, ids| {
        let bias_broadcast = ctx.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: broadcast_spec.shape.clone(),
            }),
            vec![Operand::Value(ids[1])],
            broadcast_spec,
        );
        Ok(ctx.emit(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
            vec![Operand::Value(ids[0]), Operand::Value(bias_broadcast)],
            out_spec,
        ))
    })
    .into_device_tensor()
}
