//! Matrix products lowered to `dot_general` nodes.
//!
//! Only the shapes the layer stack needs are supported: plain rank-2 matmul
//! and rank-3 batched matmul with a leading shared batch axis.

use anyhow::{bail, ensure, Result};

use crate::backend::ltir_utils;
use crate::backend::spec::{DotGeneralSpec, Operand, Operation, PortableBackend};
use crate::ops::functional::common::{
    capture_with_inputs, ensure_same_backend, ensure_same_dtype, CaptureIntoDeviceTensor,
};
use crate::tensor::spec_utils::backend_dtype;
use crate::tensor::DeviceTensor;

struct MatmulPlan {
    dot_spec: DotGeneralSpec,
    output_shape: Vec<usize>,
}

/// Decides contraction axes and the output shape, or rejects the pairing.
fn plan_matmul<B: PortableBackend + 'static>(
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<MatmulPlan> {
    ensure_same_dtype("matmul lhs", lhs, "rhs", rhs)?;
    ensure_same_backend("matmul", lhs, rhs)?;

    match (lhs.shape().dims(), rhs.shape().dims()) {
        (&[m, k_lhs], &[k_rhs, n]) => {
            ensure!(
                k_lhs == k_rhs,
                "matmul contract dimension mismatch: lhs {} vs rhs {}",
                k_lhs,
                k_rhs
            );
            Ok(MatmulPlan {
                dot_spec: DotGeneralSpec {
                    contract_lhs: vec![1],
                    contract_rhs: vec![0],
                    batch_lhs: vec![],
                    batch_rhs: vec![],
                    accum_dtype: None,
                    out_dtype: None,
                },
                output_shape: vec![m, n],
            })
        }
        (&[batch_lhs, m, k_lhs], &[batch_rhs, k_rhs, n]) => {
            ensure!(
                batch_lhs == batch_rhs,
                "matmul batch dimension mismatch: lhs {} vs rhs {}",
                batch_lhs,
                batch_rhs
            );
            ensure!(
                k_lhs == k_rhs,
                "batched matmul contract dimension mismatch: lhs {} vs rhs {}",
                k_lhs,
                k_rhs
            );
            Ok(MatmulPlan {
                dot_spec: DotGeneralSpec {
                    contract_lhs: vec![2],
                    contract_rhs: vec![1],
                    batch_lhs: vec![0],
                    batch_rhs: vec![0],
                    accum_dtype: None,
                    out_dtype: None,
                },
                output_shape: vec![batch_lhs, m, n],
            })
        }
        (lhs_dims, rhs_dims) => bail!(
            "matmul expects rank-2 or rank-3 tensors; got ranks {} and {}",
            lhs_dims.len(),
            rhs_dims.len()
        ),
    }
}

/// Matrix product of `lhs` and `rhs`, recorded as a graph node.
///
/// This is the workhorse behind [`Linear`](crate::nn::layers::Linear); inside
/// a traced loop body it lands in the capture arena like every other op.
pub fn matmul<B: PortableBackend + 'static>(
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let plan = plan_matmul(lhs, rhs)?;
    let spec = ltir_utils::tensor_spec_static(backend_dtype(lhs.dtype()), &plan.output_shape);
    let product = capture_with_inputs(&[lhs, rhs], |ctx, ids| {
        Ok(ctx.emit(
            Operation::DotGeneral(plan.dot_spec),
            vec![Operand::Value(ids[0]), Operand::Value(ids[1])],
            spec,
        ))
    })
    .into_device_tensor()?;

    debug_assert_eq!(product.shape().dims(), plan.output_shape.as_slice());
    debug_assert_eq!(product.dtype(), lhs.dtype());

    Ok(product)
}
