//! Operator layer: functional kernels plus the lazy graph they record into.
//!
//! Everything under `ops` stays backend-agnostic. `functional` exposes the
//! user-facing operators, `graph` owns the arenas that defer their execution,
//! and `trace` provides the capture contexts the loop tracer evaluates
//! closures under.
pub mod functional;
pub mod graph;
pub mod trace;

pub use functional::*;
