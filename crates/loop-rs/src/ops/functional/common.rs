//! Shared helpers backing the functional tensor API.
//!
//! These utilities provide the graph-capture entry point used by functional kernels, trait
//! adapters so `DeviceTensor` instances can call math helpers like `tensor.add(&other)`, and
//! validation routines reused across kernels.

use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};

use crate::backend::ltir_utils;
use crate::backend::spec::{
    BroadcastToSpec, CompareSpec, ComparisonOp, DType as BackendDType, ElementwiseBinaryOp,
    ElementwiseUnaryOp, Operand, Operation, PortableBackend, TensorLiteral, ValueId,
};
use crate::ops::graph::{context, GraphArena, GraphBuilder};
use crate::tensor::spec_utils::{backend_dtype, frontend_dtype, shape_from_spec};
use crate::tensor::{DType as TensorDType, DeviceTensor};

/// Math methods on device tensors. Every call records a graph node; nothing
/// executes until the result is materialised.
pub trait DeviceTensorOps<B: PortableBackend + 'static>: Sized {
    fn add(&self, rhs: &Self) -> Result<Self>;
    fn sub(&self, rhs: &Self) -> Result<Self>;
    fn mul(&self, rhs: &Self) -> Result<Self>;
    fn div(&self, rhs: &Self) -> Result<Self>;
    fn maximum(&self, rhs: &Self) -> Result<Self>;
    fn minimum(&self, rhs: &Self) -> Result<Self>;
    fn neg(&self) -> Result<Self>;
    fn abs(&self) -> Result<Self>;
    /// Adds a host scalar to every element.
    fn add_scalar(&self, value: f32) -> Result<Self>;
    fn sub_scalar(&self, value: f32) -> Result<Self>;
    fn mul_scalar(&self, value: f32) -> Result<Self>;
    /// Elementwise greater-than against a host scalar, producing a boolean tensor.
    fn gt_scalar(&self, value: f32) -> Result<Self>;
    fn lt_scalar(&self, value: f32) -> Result<Self>;
    /// Broadcasts to a larger shape with trailing-axis alignment.
    fn broadcast_to(&self, dims: &[usize]) -> Result<Self>;
    fn matmul(&self, rhs: &Self) -> Result<Self>;
}

impl<B: PortableBackend + 'static> DeviceTensorOps<B> for DeviceTensor<B> {
    fn add(&self, rhs: &Self) -> Result<Self> {
        capture_binary("add", ElementwiseBinaryOp::Add, self, rhs)
    }

    fn sub(&self, rhs: &Self) -> Result<Self> {
        capture_binary("sub", ElementwiseBinaryOp::Sub, self, rhs)
    }

    fn mul(&self, rhs: &Self) -> Result<Self> {
        capture_binary("mul", ElementwiseBinaryOp::Mul, self, rhs)
    }

    fn div(&self, rhs: &Self) -> Result<Self> {
        capture_binary("div", ElementwiseBinaryOp::Div, self, rhs)
    }

    fn maximum(&self, rhs: &Self) -> Result<Self> {
        capture_binary("maximum", ElementwiseBinaryOp::Maximum, self, rhs)
    }

    fn minimum(&self, rhs: &Self) -> Result<Self> {
        capture_binary("minimum", ElementwiseBinaryOp::Minimum, self, rhs)
    }

    fn neg(&self) -> Result<Self> {
        capture_unary(ElementwiseUnaryOp::Neg, self)
    }

    fn abs(&self) -> Result<Self> {
        capture_unary(ElementwiseUnaryOp::Abs, self)
    }

    fn add_scalar(&self, value: f32) -> Result<Self> {
        capture_scalar_binary(ElementwiseBinaryOp::Add, self, value)
    }

    fn sub_scalar(&self, value: f32) -> Result<Self> {
        capture_scalar_binary(ElementwiseBinaryOp::Sub, self, value)
    }

    fn mul_scalar(&self, value: f32) -> Result<Self> {
        capture_scalar_binary(ElementwiseBinaryOp::Mul, self, value)
    }

    fn gt_scalar(&self, value: f32) -> Result<Self> {
        capture_scalar_compare(ComparisonOp::Greater, self, value)
    }

    fn lt_scalar(&self, value: f32) -> Result<Self> {
        capture_scalar_compare(ComparisonOp::Less, self, value)
    }

    fn broadcast_to(&self, dims: &[usize]) -> Result<Self> {
        capture_broadcast(self, dims)
    }

    fn matmul(&self, rhs: &Self) -> Result<Self> {
        ensure_same_backend("matmul", self, rhs)?;
        crate::ops::functional::linalg::matmul(self, rhs)
    }
}

/// Resolves the arena new captures should record into.
///
/// Resolution order: an arena already owning one of the inputs, then the thread-local
/// default, then a fresh arena on the first input's backend.
fn resolve_capture_arena<B: PortableBackend + 'static>(
    inputs: &[&DeviceTensor<B>],
) -> Result<Arc<GraphArena<B>>> {
    if let Some(graph) = super::resolve_graph_from_tensors(inputs) {
        return Ok(graph);
    }
    if let Some(graph) = context::current_arena::<B>() {
        return Ok(graph);
    }
    let first = inputs
        .first()
        .ok_or_else(|| anyhow!("capture requires at least one input tensor"))?;
    Ok(GraphArena::new(first.backend()))
}

/// Imports `inputs` into the resolved arena and runs `f` with their value identifiers.
///
/// This is the single entry point functional kernels use to record nodes, keeping arena
/// resolution and parameter import consistent across the crate.
pub(crate) fn capture_with_inputs<B, F>(
    inputs: &[&DeviceTensor<B>],
    f: F,
) -> Result<(Arc<GraphArena<B>>, ValueId)>
where
    B: PortableBackend + 'static,
    F: FnOnce(&mut GraphBuilder<B>, &[ValueId]) -> Result<ValueId>,
{
    let graph = resolve_capture_arena(inputs)?;
    let value = graph.capture(|ctx| {
        let mut ids = Vec::with_capacity(inputs.len());
        for tensor in inputs {
            ids.push(ctx.import(tensor)?);
        }
        f(ctx, &ids)
    })?;
    Ok((graph, value))
}

/// Encodes a host scalar as a single-element literal of the requested dtype.
fn scalar_literal(dtype: TensorDType, value: f32) -> Result<TensorLiteral> {
    let bytes: Vec<u8> = match dtype {
        TensorDType::F32 => value.to_le_bytes().to_vec(),
        TensorDType::I32 => {
            ensure!(
                value.fract() == 0.0,
                "integer scalar constant must be integral, got {value}"
            );
            (value as i32).to_le_bytes().to_vec()
        }
        other => bail!("scalar constants are not supported for dtype {other:?}"),
    };
    Ok(TensorLiteral::new(
        ltir_utils::tensor_spec_static(backend_dtype(dtype), &[1]),
        Arc::<[u8]>::from(bytes),
    ))
}

/// Broadcasts a scalar literal to the provided shape inside an active capture.
fn scalar_broadcast<B: PortableBackend + 'static>(
    ctx: &mut GraphBuilder<B>,
    dtype: TensorDType,
    value: f32,
    dims: &[usize],
) -> Result<ValueId> {
    let literal = scalar_literal(dtype, value)?;
    let spec = ltir_utils::tensor_spec_static(backend_dtype(dtype), dims);
    let result_shape = spec.shape.clone();
    Ok(ctx.emit(
        Operation::BroadcastTo(BroadcastToSpec { result_shape }),
        vec![Operand::Literal(literal)],
        spec,
    ))
}

fn capture_binary<B: PortableBackend + 'static>(
    op_name: &str,
    op: ElementwiseBinaryOp,
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    ensure_same_backend(op_name, lhs, rhs)?;
    ensure_same_dtype(&format!("{op_name} lhs"), lhs, "rhs", rhs)?;
    ensure_shape_matches(&format!("{op_name} lhs"), lhs, "rhs", rhs)?;
    let spec = super::tensor_spec_from_device(lhs);
    capture_with_inputs(&[lhs, rhs], |ctx, ids| {
        Ok(ctx.emit(
            Operation::ElementwiseBinary(op),
            vec![Operand::Value(ids[0]), Operand::Value(ids[1])],
            spec,
        ))
    })
    .into_device_tensor()
}

fn capture_unary<B: PortableBackend + 'static>(
    op: ElementwiseUnaryOp,
    input: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let spec = super::tensor_spec_from_device(input);
    capture_with_inputs(&[input], |ctx, ids| {
        Ok(ctx.emit(
            Operation::ElementwiseUnary(op),
            vec![Operand::Value(ids[0])],
            spec,
        ))
    })
    .into_device_tensor()
}

fn capture_scalar_binary<B: PortableBackend + 'static>(
    op: ElementwiseBinaryOp,
    lhs: &DeviceTensor<B>,
    value: f32,
) -> Result<DeviceTensor<B>> {
    let spec = super::tensor_spec_from_device(lhs);
    let dtype = lhs.dtype();
    let dims = lhs.shape().dims().to_vec();
    capture_with_inputs(&[lhs], |ctx, ids| {
        let splat = scalar_broadcast(ctx, dtype, value, &dims)?;
        Ok(ctx.emit(
            Operation::ElementwiseBinary(op),
            vec![Operand::Value(ids[0]), Operand::Value(splat)],
            spec,
        ))
    })
    .into_device_tensor()
}

fn capture_scalar_compare<B: PortableBackend + 'static>(
    op: ComparisonOp,
    lhs: &DeviceTensor<B>,
    value: f32,
) -> Result<DeviceTensor<B>> {
    let dtype = lhs.dtype();
    let dims = lhs.shape().dims().to_vec();
    let spec = ltir_utils::tensor_spec_static(BackendDType::I1, &dims);
    capture_with_inputs(&[lhs], |ctx, ids| {
        let splat = scalar_broadcast(ctx, dtype, value, &dims)?;
        Ok(ctx.emit(
            Operation::Compare(CompareSpec { op }),
            vec![Operand::Value(ids[0]), Operand::Value(splat)],
            spec,
        ))
    })
    .into_device_tensor()
}

fn capture_broadcast<B: PortableBackend + 'static>(
    input: &DeviceTensor<B>,
    dims: &[usize],
) -> Result<DeviceTensor<B>> {
    let in_dims = input.shape().dims();
    ensure!(
        in_dims.len() <= dims.len(),
        "broadcast_to target rank {} is smaller than input rank {}",
        dims.len(),
        in_dims.len()
    );
    let offset = dims.len() - in_dims.len();
    for (axis, (have, want)) in in_dims.iter().zip(dims[offset..].iter()).enumerate() {
        ensure!(
            *have == *want || *have == 1,
            "broadcast_to cannot expand axis {} from {} to {}",
            axis + offset,
            have,
            want
        );
    }
    let spec = ltir_utils::tensor_spec_static(backend_dtype(input.dtype()), dims);
    let result_shape = spec.shape.clone();
    capture_with_inputs(&[input], |ctx, ids| {
        Ok(ctx.emit(
            Operation::BroadcastTo(BroadcastToSpec { result_shape }),
            vec![Operand::Value(ids[0])],
            spec,
        ))
    })
    .into_device_tensor()
}

/// Rejects operands on different backend instances; returns the shared one.
pub(crate) fn ensure_same_backend<B: PortableBackend + 'static>(
    op_name: &str,
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<Arc<B>> {
    let backend = lhs.backend();
    ensure!(
        Arc::ptr_eq(&backend, &rhs.backend()),
        "{} operands must be placed on the same backend: {} vs {}",
        op_name,
        backend.backend_name(),
        rhs.backend().backend_name()
    );
    Ok(backend)
}

pub(crate) fn ensure_same_dtype<B: PortableBackend + 'static>(
    lhs_name: &str,
    lhs: &DeviceTensor<B>,
    rhs_name: &str,
    rhs: &DeviceTensor<B>,
) -> Result<()> {
    let (left, right) = (lhs.dtype(), rhs.dtype());
    ensure!(
        left == right,
        "{lhs_name} dtype {left:?} must match {rhs_name} dtype {right:?}"
    );
    Ok(())
}

pub(crate) fn ensure_rank<B: PortableBackend + 'static>(
    tensor_name: &str,
    tensor: &DeviceTensor<B>,
    expected_rank: usize,
) -> Result<()> {
    let dims = tensor.shape().dims();
    ensure!(
        dims.len() == expected_rank,
        "{tensor_name} must have rank {expected_rank}, got {dims:?}"
    );
    Ok(())
}

pub(crate) fn ensure_last_dim<B: PortableBackend + 'static>(
    tensor_name: &str,
    tensor: &DeviceTensor<B>,
    expected: usize,
) -> Result<()> {
    let last = tensor
        .shape()
        .dims()
        .last()
        .copied()
        .ok_or_else(|| anyhow!("{tensor_name} missing trailing dimension data"))?;
    ensure!(
        last == expected,
        "{tensor_name} last dimension must be {expected}, got {:?}",
        tensor.shape().dims()
    );
    Ok(())
}

pub(crate) fn ensure_rank_at_least<B: PortableBackend + 'static>(
    tensor_name: &str,
    tensor: &DeviceTensor<B>,
    min_rank: usize,
) -> Result<()> {
    let dims = tensor.shape().dims();
    ensure!(
        dims.len() >= min_rank,
        "{tensor_name} must have rank >= {min_rank}, got {dims:?}"
    );
    Ok(())
}

pub(crate) fn ensure_shape_matches<B: PortableBackend + 'static>(
    lhs_name: &str,
    lhs: &DeviceTensor<B>,
    rhs_name: &str,
    rhs: &DeviceTensor<B>,
) -> Result<()> {
    let (left, right) = (lhs.shape().dims(), rhs.shape().dims());
    ensure!(
        left == right,
        "{lhs_name} shape {left:?} must match {rhs_name} shape {right:?}"
    );
    Ok(())
}

/// Turns a finished capture into the device tensor wrapping its result value.
pub trait CaptureIntoDeviceTensor<B: PortableBackend + 'static> {
    fn into_device_tensor(self) -> Result<DeviceTensor<B>>;
}

impl<B: PortableBackend + 'static> CaptureIntoDeviceTensor<B> for (Arc<GraphArena<B>>, ValueId) {
    fn into_device_tensor(self) -> Result<DeviceTensor<B>> {
        let (graph, value) = self;
        let spec = graph
            .tensor_spec_for(value)
            .ok_or_else(|| anyhow!("value {value:?} missing tensor spec"))?;
        let shape = shape_from_spec(&spec)?;
        DeviceTensor::from_lazy(graph, shape, frontend_dtype(spec.dtype), value)
    }
}

impl<B: PortableBackend + 'static> CaptureIntoDeviceTensor<B>
    for Result<(Arc<GraphArena<B>>, ValueId)>
{
    fn into_device_tensor(self) -> Result<DeviceTensor<B>> {
        self.and_then(|capture| capture.into_device_tensor())
    }
}
