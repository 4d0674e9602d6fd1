//! Short constructors for IR metadata, used anywhere a fully static
//! shape is already known.

use std::sync::Arc;

use crate::backend::spec::{DType, Dimension, Shape, TensorLiteral, TensorSpec, ValueType};

/// Shape whose every dimension is static.
pub fn shape_static(dims: &[usize]) -> Shape {
    let dims: Vec<Dimension> = dims.iter().copied().map(Dimension::Static).collect();
    Shape::new(dims)
}

/// Tensor spec over [`shape_static`] dimensions.
pub fn tensor_spec_static(dtype: DType, dims: &[usize]) -> TensorSpec {
    TensorSpec::new(dtype, shape_static(dims))
}

/// All-zero literal for a static spec.
pub fn tensor_literal_zeros(spec: TensorSpec) -> TensorLiteral {
    let byte_len = spec
        .byte_len()
        .expect("tensor_literal_zeros requires a static tensor spec");
    TensorLiteral::new(spec, Arc::<[u8]>::from(vec![0u8; byte_len]))
}

/// Wraps a tensor spec as a value type.
pub fn value_type_tensor(spec: TensorSpec) -> ValueType {
    ValueType::Tensor(spec)
}
