//! Layers built from reusable functional primitives.
//!
//! Each layer wraps lower-level functional ops and exposes ergonomic `forward` helpers.
//! Layers intentionally focus on inference-only forward paths.

pub mod linear;

pub use linear::Linear;
