//! Mutable graph state guarded by the arena lock.

use std::collections::HashMap;

use crate::backend::spec::{Operand, Operation, PortableBackend, TensorSpec, ValueId};
use crate::tensor::InputRole;

/// Everything an arena knows about its graph: recorded nodes keyed by value id,
/// the emission order, and the imports made so far. `import_lookup` keys
/// imports by `(role, stable_id)` so re-importing the same tensor hands back
/// the existing graph input instead of growing the list; the tracer relies on
/// this when it audits how many inputs a closure actually pulled in.
pub(super) struct GraphInner<B: PortableBackend + 'static> {
    pub(super) next_value: u32,
    pub(super) version: u64,
    pub(super) nodes: HashMap<ValueId, NodeRecord<B>>,
    pub(super) order: Vec<ValueId>,
    pub(super) imports: Vec<ImportRecord<B>>,
    pub(super) import_lookup: HashMap<(InputRole, u64), ValueId>,
}

impl<B: PortableBackend + 'static> GraphInner<B> {
    pub(super) fn new() -> Self {
        GraphInner {
            next_value: 0,
            version: 0,
            nodes: HashMap::new(),
            order: Vec::new(),
            imports: Vec::new(),
            import_lookup: HashMap::new(),
        }
    }

    pub(super) fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    pub(super) fn push_import(&mut self, record: ImportRecord<B>) {
        self.imports.push(record);
    }

    pub(super) fn import_for(&self, value: ValueId) -> Option<&ImportRecord<B>> {
        self.imports.iter().find(|record| record.value == value)
    }
}

/// Whether a node still needs execution or already holds a backend handle.
pub(super) enum NodeState<B: PortableBackend + 'static> {
    Pending,
    Ready(B::TensorHandle),
}

/// One recorded operation: what to run, on which operands, producing which spec.
pub(super) struct NodeRecord<B: PortableBackend + 'static> {
    pub(super) op: Operation,
    pub(super) operands: Vec<Operand>,
    pub(super) spec: TensorSpec,
    pub(super) state: NodeState<B>,
}

/// An imported graph input: the backend handle it binds to plus the identity
/// under which it was deduplicated.
pub(super) struct ImportRecord<B: PortableBackend + 'static> {
    pub(super) value: ValueId,
    pub(super) spec: TensorSpec,
    pub(super) handle: B::TensorHandle,
    pub(super) role: InputRole,
    pub(super) stable_id: Option<u64>,
}
