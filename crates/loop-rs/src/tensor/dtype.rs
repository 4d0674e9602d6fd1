//! Scalar element types a host tensor can carry.

/// Element type tag shared between host tensors and backend handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// IEEE-754 single precision.
    F32,
    /// Half precision (fp16).
    F16,
    /// bfloat16, the truncated single-precision format.
    BF16,
    /// 32-bit signed integer, primarily for loop counters and index buffers.
    I32,
    /// Single-byte boolean, produced by comparison ops and consumed by loop predicates.
    Bool,
}

impl DType {
    /// Bytes per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I32 => 4,
            DType::Bool => 1,
        }
    }
}
