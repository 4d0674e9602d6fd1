//! CPU-side tensors: the currency for uploading inputs and reading results back.

use std::mem::{size_of, ManuallyDrop};
use std::sync::Arc;

use anyhow::{ensure, Result};
use rand::Rng;

use crate::backend::spec::{TensorLiteral, TensorSpec};

use super::{dtype::DType, shape::Shape, spec_utils};

/// Plain byte-backed tensor on the host. Construction goes through the typed
/// helpers below; the bytes convert to and from backend [`TensorLiteral`]s.
#[derive(Debug, Clone)]
pub struct Tensor {
    dtype: DType,
    shape: Shape,
    data: Vec<u8>,
}

impl Tensor {
    fn from_elements<T>(shape: Shape, dtype: DType, elements: Vec<T>) -> Result<Self> {
        ensure!(
            elements.len() == shape.num_elements(),
            "tensor data length ({}) does not match shape {:?}",
            elements.len(),
            shape.dims()
        );
        Ok(Tensor {
            dtype,
            shape,
            data: vec_into_bytes(elements),
        })
    }

    /// Builds an `F32` tensor, checking that `data` fills `shape` exactly.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        Self::from_elements(shape, DType::F32, data)
    }

    /// Builds an `I32` tensor, checking that `data` fills `shape` exactly.
    pub fn from_i32(shape: Shape, data: Vec<i32>) -> Result<Self> {
        Self::from_elements(shape, DType::I32, data)
    }

    /// All-zero `I32` tensor; the integer placeholder recipe.
    pub fn zeros_i32(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            dtype: DType::I32,
            shape,
            data: vec_into_bytes(vec![0i32; len]),
        }
    }

    /// All-false `Bool` tensor; the boolean placeholder recipe.
    pub fn zeros_bool(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            dtype: DType::Bool,
            shape,
            data: vec![0u8; len],
        }
    }

    /// `N(0, std^2)` samples via Box-Muller; the float placeholder recipe.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len + 1);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let radius = (-2.0 * u1.ln()).sqrt() * std;
            let angle = 2.0 * std::f32::consts::PI * u2;
            values.push(radius * angle.cos());
            values.push(radius * angle.sin());
        }
        values.truncate(len);
        Tensor {
            dtype: DType::F32,
            shape,
            data: vec_into_bytes(values),
        }
    }

    /// The tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The payload's scalar type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Views the payload as `f32`. Panics when the dtype is anything else.
    pub fn data(&self) -> &[f32] {
        assert!(self.dtype == DType::F32, "tensor data is not stored as f32");
        bytes_as_slice(&self.data)
    }

    /// Views the payload as `i32`. Panics when the dtype is anything else.
    pub fn data_i32(&self) -> &[i32] {
        assert!(self.dtype == DType::I32, "tensor data is not stored as i32");
        bytes_as_slice(&self.data)
    }

    /// Views boolean data as raw `0`/`1` bytes. Panics when the dtype is anything else.
    pub fn data_bool(&self) -> &[u8] {
        assert!(
            self.dtype == DType::Bool,
            "tensor data is not stored as bool"
        );
        &self.data
    }

    /// Packages the tensor as a literal the backend can ingest.
    pub fn to_literal(&self) -> TensorLiteral {
        let spec = TensorSpec::new(
            spec_utils::backend_dtype(self.dtype),
            spec_utils::backend_shape_from_shape(&self.shape),
        );
        TensorLiteral::new(spec, Arc::from(self.data.clone()))
    }

    /// Rebuilds a host tensor from a literal a backend produced.
    pub fn from_literal(literal: &TensorLiteral) -> Result<Self> {
        let dtype = spec_utils::frontend_dtype(literal.spec.dtype);
        let shape = spec_utils::shape_from_spec(&literal.spec)?;
        let expected_bytes = shape.num_elements() * dtype.size_in_bytes();
        ensure!(
            literal.bytes.len() == expected_bytes,
            "literal byte length {} does not match expected {}",
            literal.bytes.len(),
            expected_bytes
        );
        Ok(Tensor {
            dtype,
            shape,
            data: literal.bytes.to_vec(),
        })
    }
}

/// Reinterprets an owned typed vector as its byte representation, no copy.
fn vec_into_bytes<T>(data: Vec<T>) -> Vec<u8> {
    let mut data = ManuallyDrop::new(data);
    let (ptr, len, cap) = (data.as_mut_ptr(), data.len(), data.capacity());
    unsafe { Vec::from_raw_parts(ptr as *mut u8, len * size_of::<T>(), cap * size_of::<T>()) }
}

/// Reinterprets bytes as a typed slice after checking size alignment.
fn bytes_as_slice<T>(bytes: &[u8]) -> &[T] {
    let elem = size_of::<T>();
    assert_eq!(
        bytes.len() % elem,
        0,
        "byte length {} is not a multiple of element size {}",
        bytes.len(),
        elem
    );
    unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast(), bytes.len() / elem) }
}
