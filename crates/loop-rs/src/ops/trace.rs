//! Observation hooks around backend program submissions.
//!
//! A [`TraceSink`] installed for the current thread receives a callback pair around
//! every program the crate hands to a backend: the graph arena's materialisation
//! path and the control-flow invoker both report through the same hooks. Sinks see
//! the full [`Program`] before execution and a [`ProgramStats`] summary afterwards,
//! which is enough to count submissions, dump IR, or time executions in tests and
//! debugging sessions without threading a logger through every call site.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backend::spec::{Program, ValueId};

/// Receives callbacks around each backend program submission.
pub trait TraceSink {
    /// Called immediately before the program is handed to the backend.
    fn before_program(&self, context: &ProgramContext, program: &Program);

    /// Called after the backend returns, successfully or not.
    fn after_program(&self, context: &ProgramContext, stats: &ProgramStats);
}

/// Submission metadata shared by both callbacks.
#[derive(Debug, Clone)]
pub struct ProgramContext {
    /// Monotonically increasing id, unique per submission within the process.
    pub trace_id: u64,
    /// Identifier of the originating graph arena, when one exists.
    pub graph_id: Option<usize>,
    /// Backend name the program was submitted to.
    pub backend: String,
    /// Values the caller asked to materialise.
    pub targets: Vec<ValueId>,
    /// Output value ids the program produces, in result order.
    pub outputs: Vec<ValueId>,
    /// Wall-clock time the submission started.
    pub timestamp: SystemTime,
    /// What kind of work the submission performs.
    pub kind: ProgramKind,
}

/// Classifies a program submission.
#[derive(Debug, Clone)]
pub enum ProgramKind {
    /// Flushing pending lazy graph nodes for the given values.
    Materialize { values: Vec<ValueId> },
    /// Running a lowered control-flow loop.
    Loop { carried: usize, additional: usize },
}

/// Post-execution summary handed to [`TraceSink::after_program`].
#[derive(Debug, Clone)]
pub struct ProgramStats {
    pub duration: Duration,
    pub output_count: usize,
    pub status: ProgramStatus,
}

#[derive(Debug, Clone)]
pub enum ProgramStatus {
    Success,
    Failure { message: String },
}

thread_local! {
    static CURRENT_SINK: RefCell<Option<Arc<dyn TraceSink>>> = const { RefCell::new(None) };
}

static TRACE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocates the next submission id.
pub fn next_trace_id() -> u64 {
    TRACE_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Installs a sink for the current thread, replacing any previous one.
pub fn install_sink(sink: Arc<dyn TraceSink>) {
    CURRENT_SINK.with(|current| {
        *current.borrow_mut() = Some(sink);
    });
}

/// Removes the current thread's sink, if any.
pub fn clear_sink() {
    CURRENT_SINK.with(|current| {
        current.borrow_mut().take();
    });
}

/// Returns the sink installed for the current thread.
pub fn current_sink() -> Option<Arc<dyn TraceSink>> {
    CURRENT_SINK.with(|current| current.borrow().clone())
}
