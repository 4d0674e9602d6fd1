//! Model-layer building blocks assembled from the functional operators.
//!
//! A layer owns its parameters as device tensors and records graph nodes in
//! `forward`; nothing here talks to a backend directly, so layers work
//! unchanged inside traced loop bodies.

pub mod layers;

pub use layers::*;
