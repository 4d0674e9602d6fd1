//! Capture-session handle for staging imports and nodes inside a
//! [`GraphArena`](super::arena::GraphArena).

use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::{Operand, Operation, PortableBackend, TensorSpec, ValueId};
use crate::tensor::{DeviceTensor, InputRole, LazyHandle};

use super::arena::GraphArena;
use super::state::{GraphInner, ImportRecord, NodeRecord, NodeState};

/// Handed to [`GraphArena::capture`] closures; the only way to add to a graph.
pub struct GraphBuilder<'a, B: PortableBackend + 'static> {
    pub(super) arena: Arc<GraphArena<B>>,
    pub(super) state: &'a mut GraphInner<B>,
}

impl<'a, B: PortableBackend + 'static> GraphBuilder<'a, B> {
    /// Brings a tensor into this graph as an operand, returning its value id.
    ///
    /// Ready handles are deduplicated by `(role, stable_id)`: importing the
    /// same tensor twice yields the same graph input. A node belonging to this
    /// arena resolves to its own id; a node from a foreign arena is
    /// materialized and re-imported as a fresh input. That fresh input is what
    /// the loop tracer's capture audit catches when a closure smuggles in
    /// tensors outside its declared inputs.
    pub fn import(&mut self, tensor: &DeviceTensor<B>) -> Result<ValueId> {
        match &**tensor.lazy_handle() {
            LazyHandle::Ready { id, role, .. } => {
                let key = (*role, *id);
                if let Some(existing) = self.state.import_lookup.get(&key) {
                    return Ok(*existing);
                }

                let handle = tensor.materialize()?;
                let value = self.allocate_value();
                self.state.push_import(ImportRecord {
                    value,
                    spec: tensor.tensor_spec(),
                    handle,
                    role: *role,
                    stable_id: Some(*id),
                });
                self.state.import_lookup.insert(key, value);
                self.state.bump_version();
                Ok(value)
            }
            LazyHandle::Deferred { graph, value } => {
                if Arc::ptr_eq(graph, &self.arena) {
                    return Ok(*value);
                }
                let handle = tensor.materialize()?;
                let fresh = self.allocate_value();
                self.state.push_import(ImportRecord {
                    value: fresh,
                    spec: tensor.tensor_spec(),
                    handle,
                    role: InputRole::Arg,
                    stable_id: None,
                });
                self.state.bump_version();
                Ok(fresh)
            }
        }
    }

    /// Records a pending operation node and returns its output value id.
    /// Emission order is preserved, so lowering can walk nodes front to back.
    pub fn emit(&mut self, op: Operation, operands: Vec<Operand>, spec: TensorSpec) -> ValueId {
        let value = self.allocate_value();
        let record = NodeRecord {
            op,
            operands,
            spec,
            state: NodeState::Pending,
        };
        self.state.nodes.insert(value, record);
        self.state.order.push(value);
        self.state.bump_version();
        value
    }

    fn allocate_value(&mut self) -> ValueId {
        let next = ValueId(self.state.next_value);
        self.state.next_value += 1;
        next
    }
}
