//! Conversions between frontend tensor metadata and the IR's own types.

use anyhow::{bail, Result};

use crate::backend::ltir_utils;
use crate::backend::spec::{DType as BackendDType, Dimension, Shape as BackendShape, TensorSpec};
use crate::tensor::{DType as TensorDType, Shape as TensorShape};

/// Backend shape for a frontend [`TensorShape`]; frontend shapes are always static.
pub(crate) fn backend_shape_from_shape(shape: &TensorShape) -> BackendShape {
    ltir_utils::shape_static(shape.dims())
}

pub(crate) fn backend_dtype(dtype: TensorDType) -> BackendDType {
    match dtype {
        TensorDType::F32 => BackendDType::F32,
        TensorDType::F16 => BackendDType::F16,
        TensorDType::BF16 => BackendDType::Bf16,
        TensorDType::I32 => BackendDType::Si32,
        TensorDType::Bool => BackendDType::I1,
    }
}

pub(crate) fn frontend_dtype(dtype: BackendDType) -> TensorDType {
    match dtype {
        BackendDType::F32 => TensorDType::F32,
        BackendDType::F16 => TensorDType::F16,
        BackendDType::Bf16 => TensorDType::BF16,
        BackendDType::Si32 => TensorDType::I32,
        BackendDType::I1 => TensorDType::Bool,
    }
}

/// Frontend [`TensorShape`] for an IR spec. Dynamic dimensions are rejected
/// so callers catch unsupported programs before lowering.
pub(crate) fn shape_from_spec(spec: &TensorSpec) -> Result<TensorShape> {
    let mut dims = Vec::with_capacity(spec.shape.rank());
    for dim in spec.shape.dims() {
        match dim {
            Dimension::Static(extent) => dims.push(*extent),
            Dimension::Dynamic(sym) => bail!(
                "dynamic dimension {:?} not supported in portable frontend",
                sym
            ),
        }
    }
    Ok(TensorShape::new(dims))
}
