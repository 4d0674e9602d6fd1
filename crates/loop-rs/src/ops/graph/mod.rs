//! Arena-backed graphs of deferred operations.
//!
//! A builder imports tensors and emits nodes; the arena lowers whatever a
//! materialisation needs into one backend program and runs it. Capture-only
//! arenas back the control-flow tracer, which turns their contents into IR
//! regions instead of executing them.
mod arena;
mod builder;
pub mod context;
mod state;

pub use arena::GraphArena;
pub use builder::GraphBuilder;
