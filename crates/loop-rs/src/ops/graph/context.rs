//! Thread-local default arena used for implicit graph capture.
//!
//! Functional operators record into the arena that already owns one of their
//! inputs; when no input has one, they fall back to the arena installed here,
//! and only then spin up a fresh arena. Installing a default is how the loop
//! tracer redirects everything a closure does into its capture-only arena:
//!
//! ```rust,ignore
//! let trace = GraphArena::capture_only(backend);
//! let result = with_default_arena(Arc::clone(&trace), || body_fn(&placeholders, &extra));
//! ```
//!
//! The stack is per-thread and nests; the innermost matching arena wins. Guards
//! unwind it in drop order, so a panicking closure cannot leave a stale default
//! behind.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

use crate::backend::spec::PortableBackend;

use super::GraphArena;

// Entries are type-erased so arenas over different backends can share one stack.
thread_local! {
    static DEFAULT_ARENAS: RefCell<Vec<Arc<dyn Any + Send + Sync>>> = RefCell::new(Vec::new());
}

/// Pops the installed arena when dropped.
struct ArenaGuard(());

impl Drop for ArenaGuard {
    fn drop(&mut self) {
        DEFAULT_ARENAS.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn push_default_arena<B: PortableBackend + 'static>(arena: Arc<GraphArena<B>>) -> ArenaGuard {
    DEFAULT_ARENAS.with(|stack| stack.borrow_mut().push(arena));
    ArenaGuard(())
}

/// Runs `f` with `arena` installed as the default, uninstalling it afterwards.
pub fn with_default_arena<B, F, R>(arena: Arc<GraphArena<B>>, f: F) -> R
where
    B: PortableBackend + 'static,
    F: FnOnce() -> R,
{
    let _guard = push_default_arena(arena);
    f()
}

/// Returns the innermost installed arena whose backend type is `B`, if any.
pub fn current_arena<B: PortableBackend + 'static>() -> Option<Arc<GraphArena<B>>> {
    DEFAULT_ARENAS.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find_map(|entry| Arc::clone(entry).downcast::<GraphArena<B>>().ok())
    })
}
