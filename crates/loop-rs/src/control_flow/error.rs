//! Error taxonomy for the loop lowering pipeline.
//!
//! Every failure is tagged with the [`Stage`] that produced it so callers can
//! tell a closure bug (tracing), a signature mismatch (reconciling), and a
//! backend rejection (compiling/executing) apart without string matching.

use thiserror::Error;

use crate::backend::spec::BackendError;

/// Pipeline stage in which a loop lowering failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Probing,
    TracingCond,
    TracingBody,
    Reconciling,
    Assembling,
    Compiling,
    Executing,
    Unwrapping,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Probing => "probing",
            Stage::TracingCond => "tracing cond",
            Stage::TracingBody => "tracing body",
            Stage::Reconciling => "reconciling",
            Stage::Assembling => "assembling",
            Stage::Compiling => "compiling",
            Stage::Executing => "executing",
            Stage::Unwrapping => "unwrapping",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which user closure a tracing failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callable {
    Cond,
    Body,
}

impl std::fmt::Display for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Callable::Cond => "cond",
            Callable::Body => "body",
        })
    }
}

/// What went wrong, independent of where in the pipeline it happened.
#[derive(Debug, Error)]
pub enum LoopErrorKind {
    /// A user closure returned an error or emitted untraceable work.
    #[error("{callable} closure failed: {source}")]
    Tracing {
        callable: Callable,
        #[source]
        source: anyhow::Error,
    },
    /// The traced regions do not line up with the declared loop signature.
    #[error("{message}")]
    Reconciliation { message: String },
    /// The backend rejected the lowered program before running it.
    #[error("program compilation failed: {source}")]
    Compile {
        #[source]
        source: BackendError,
    },
    /// The backend failed while running the lowered program.
    #[error("program execution failed: {source}")]
    Execution {
        #[source]
        source: BackendError,
    },
    /// The driver refused the request before any tracing started.
    #[error("{message}")]
    Precondition { message: String },
}

/// Error returned by [`while_loop`](crate::control_flow::while_loop) and
/// [`fori_loop`](crate::control_flow::fori_loop).
#[derive(Debug, Error)]
#[error("loop lowering failed while {stage}: {kind}")]
pub struct LoopError {
    stage: Stage,
    #[source]
    kind: LoopErrorKind,
}

impl LoopError {
    pub(crate) fn new(stage: Stage, kind: LoopErrorKind) -> Self {
        Self { stage, kind }
    }

    pub(crate) fn precondition(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(
            stage,
            LoopErrorKind::Precondition {
                message: message.into(),
            },
        )
    }

    pub(crate) fn reconciliation(message: impl Into<String>) -> Self {
        Self::new(
            Stage::Reconciling,
            LoopErrorKind::Reconciliation {
                message: message.into(),
            },
        )
    }

    /// Stage of the pipeline that produced the failure.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Failure classification carrying the underlying cause.
    pub fn kind(&self) -> &LoopErrorKind {
        &self.kind
    }
}

/// Recovers a typed [`BackendError`] from an `anyhow` chain, falling back to
/// an execution error that preserves the chain text.
pub(crate) fn backend_error_from(err: anyhow::Error) -> BackendError {
    match err.downcast::<BackendError>() {
        Ok(backend) => backend,
        Err(other) => BackendError::execution(format!("{other:#}")),
    }
}
