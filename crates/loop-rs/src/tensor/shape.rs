//! Dimension bookkeeping shared by host and device tensors.

/// Logical dimensions of a tensor, rank 1 or higher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Wraps a dimension list. Panics on an empty list; scalars are `[1]` here.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        Shape { dims }
    }

    /// The raw dimension slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Product of all dimensions.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}
