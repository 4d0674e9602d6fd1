//! Arena of deferred tensor operations, executed on demand.
//!
//! Every `DeviceTensor` points at one of these. Functional ops append nodes
//! through [`GraphArena::capture`]; nothing runs until someone asks for a
//! tensor's bytes, at which point the arena lowers the pending subgraph into a
//! single backend program, executes it, and parks the produced handles on their
//! nodes so no node runs twice.
//!
//! ```text
//! DeviceTensor --Arc--> GraphArena --+-- GraphInner (nodes, imports)
//!                                    `-- Backend    (program execution)
//! ```
//!
//! Capture-only arenas are the tracing variant: they record nodes like any other arena
//! but refuse to execute programs, so closures traced against them stay hermetic. The
//! recorded graph is read back out through [`GraphArena::lower_region`] instead.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, bail, ensure, Result};

use crate::backend::spec::{
    Operand, Operation, PortableBackend, Program, ProgramBuilder, Region, RegionId, TensorSpec,
    ValueId, ValueType,
};
use crate::ops::trace::{self, ProgramContext, ProgramKind, ProgramStats, ProgramStatus};

use super::builder::GraphBuilder;
use super::state::{GraphInner, NodeState};

/// Records deferred operations against one backend instance and lowers them
/// into programs when values are requested.
pub struct GraphArena<B: PortableBackend + 'static> {
    backend: Arc<B>,
    inner: Mutex<GraphInner<B>>,
    capture_only: bool,
    id: usize,
}

static ARENA_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

impl<B: PortableBackend + 'static> GraphArena<B> {
    /// An executing arena on `backend`.
    pub fn new(backend: Arc<B>) -> Arc<Self> {
        Self::with_capture_only(backend, false)
    }

    /// Creates a capture-only arena used for hermetic closure tracing.
    ///
    /// Capture-only arenas record nodes but never execute them; attempting to
    /// materialise a value through one is an error. Their contents are read back
    /// via [`GraphArena::lower_region`].
    pub fn capture_only(backend: Arc<B>) -> Arc<Self> {
        Self::with_capture_only(backend, true)
    }

    fn with_capture_only(backend: Arc<B>, capture_only: bool) -> Arc<Self> {
        let id = ARENA_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        Arc::new(GraphArena {
            backend,
            inner: Mutex::new(GraphInner::new()),
            capture_only,
            id,
        })
    }

    /// The backend this arena lowers programs onto.
    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    /// Reports whether this arena is restricted to recording nodes.
    pub(crate) fn is_capture_only(&self) -> bool {
        self.capture_only
    }

    pub(crate) fn try_ready_handle(&self, value: ValueId) -> Option<B::TensorHandle> {
        let inner = self.inner.lock().expect("graph arena poisoned");
        ready_handle_of(&inner, value).ok().flatten()
    }

    pub(crate) fn tensor_spec_for(&self, value: ValueId) -> Option<TensorSpec> {
        let inner = self.inner.lock().expect("graph arena poisoned");
        if let Some(record) = inner.nodes.get(&value) {
            return Some(record.spec.clone());
        }
        inner.import_for(value).map(|record| record.spec.clone())
    }

    /// Runs `f` with a [`GraphBuilder`] staging imports and nodes into this
    /// arena. Nothing executes here; the recorded nodes wait for a
    /// materialisation request.
    pub fn capture<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut GraphBuilder<B>) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock().expect("graph arena poisoned");
        let mut builder = GraphBuilder {
            arena: Arc::clone(self),
            state: &mut *inner,
        };
        f(&mut builder)
    }

    /// Produces the backend handle for `value`, running whatever part of the
    /// graph it still needs as one program.
    pub fn materialize(&self, value: ValueId) -> Result<B::TensorHandle> {
        let mut handles = self.materialize_values(&[value])?;
        handles
            .pop()
            .ok_or_else(|| anyhow!("value missing after execution"))
    }

    /// Batch form of [`GraphArena::materialize`]: one program covers every
    /// pending dependency of `values`, and each node runs at most once.
    pub fn materialize_values(&self, values: &[ValueId]) -> Result<Vec<B::TensorHandle>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        if self.capture_only {
            bail!("capture-only arena cannot execute programs");
        }

        match self.prepare_plan(values)? {
            PlanOutcome::AllReady(handles) => Ok(handles),
            PlanOutcome::Stage(staged) => {
                let plan = self.lower_plan(staged)?;
                let entry_inputs = self.collect_entry_inputs(&plan)?;
                self.execute_plan(&plan, values, entry_inputs)
            }
        }
    }

    /// Returns the imported parameter values and specs in import order.
    ///
    /// Tracing uses this to audit which inputs a captured closure actually pulled in.
    pub(crate) fn imported_parameters(&self) -> Vec<(ValueId, TensorSpec)> {
        let inner = self.inner.lock().expect("graph arena poisoned");
        inner
            .imports
            .iter()
            .map(|record| (record.value, record.spec.clone()))
            .collect()
    }

    /// Lowers the dependency closure of `results` into a [`Region`] whose parameter list
    /// is exactly `parameters`, in order.
    ///
    /// Every value a lowered instruction references must be reachable from `parameters`;
    /// a reference to anything else means the captured closure escaped its inputs.
    pub(crate) fn lower_region(
        &self,
        id: RegionId,
        parameters: &[ValueId],
        results: &[ValueId],
    ) -> Result<Region> {
        let inner = self.inner.lock().expect("graph arena poisoned");

        let mut builder = ProgramBuilder::new();
        let mut mapping: HashMap<ValueId, ValueId> = HashMap::new();
        let param_set: HashSet<ValueId> = parameters.iter().copied().collect();

        for value in parameters {
            let spec = inner
                .import_for(*value)
                .map(|record| record.spec.clone())
                .ok_or_else(|| {
                    anyhow!("value {:?} is not an imported parameter of this arena", value)
                })?;
            let new_id = builder.add_parameter(ValueType::Tensor(spec));
            mapping.insert(*value, new_id);
        }

        let mut needed = HashSet::new();
        for value in results {
            if inner.nodes.contains_key(value) {
                gather_region_nodes(&inner, *value, &param_set, &mut needed)?;
            } else if !param_set.contains(value) {
                bail!(
                    "region result {:?} is neither a recorded node nor a region parameter",
                    value
                );
            }
        }

        for value in &inner.order {
            if !needed.contains(value) {
                continue;
            }
            let node = inner
                .nodes
                .get(value)
                .ok_or_else(|| anyhow!("missing node for value {:?}", value))?;
            let mapped_operands = node
                .operands
                .iter()
                .map(|operand| remap_operand(&mapping, operand))
                .collect::<Result<Vec<_>>>()?;
            let new_id = builder.emit(
                node.op.clone(),
                mapped_operands,
                ValueType::Tensor(node.spec.clone()),
            );
            mapping.insert(*value, new_id);
        }

        let result_ids = results
            .iter()
            .map(|original| {
                mapping
                    .get(original)
                    .copied()
                    .ok_or_else(|| anyhow!("missing mapping for region result {:?}", original))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(builder.finish_region(id, result_ids))
    }

    /// Splits `targets` into what is already materialised and what still needs
    /// lowering. The staged subgraph carries pending nodes in insertion order,
    /// so operands always precede their consumers, plus the ready values and
    /// imports that will bind as program parameters.
    fn prepare_plan(&self, targets: &[ValueId]) -> Result<PlanOutcome<B>> {
        let inner = self.inner.lock().expect("graph arena poisoned");

        let mut ready_handles: Vec<Option<B::TensorHandle>> = Vec::with_capacity(targets.len());
        let mut any_pending = false;
        for value in targets {
            let entry = ready_handle_of(&inner, *value)?;
            any_pending |= entry.is_none();
            ready_handles.push(entry);
        }

        if !any_pending {
            let ready = ready_handles
                .into_iter()
                .map(|entry| entry.expect("ready handle missing"));
            return Ok(PlanOutcome::AllReady(ready.collect()));
        }

        let mut requested = Vec::new();
        let mut seen = HashSet::new();
        for value in targets {
            if seen.insert(*value) {
                requested.push(*value);
            }
        }

        let mut pending = HashSet::new();
        let mut ready_inputs = HashSet::new();
        for value in &requested {
            if inner.nodes.contains_key(value) {
                classify_producers(&inner, *value, &mut pending, &mut ready_inputs)?;
            }
        }

        let mut input_values: Vec<_> = ready_inputs.into_iter().collect();
        input_values.sort_by_key(|value| value.0);

        let mut parameters: Vec<PlanParameter> = Vec::with_capacity(input_values.len());
        for value in &input_values {
            if let Some(record) = inner.import_for(*value) {
                parameters.push(PlanParameter {
                    value: *value,
                    spec: record.spec.clone(),
                });
                continue;
            }
            let node = inner
                .nodes
                .get(value)
                .ok_or_else(|| anyhow!("input value {:?} not registered", value))?;
            ensure!(
                matches!(node.state, NodeState::Ready(_)),
                "input value {value:?} still pending"
            );
            parameters.push(PlanParameter {
                value: *value,
                spec: node.spec.clone(),
            });
        }

        // Only requested values become program outputs, kept in creation order.
        let mut outputs = Vec::new();
        for value in &inner.order {
            if requested.contains(value) {
                outputs.push(*value);
            }
        }

        let mut nodes = Vec::new();
        for value in &inner.order {
            if !pending.contains(value) {
                continue;
            }
            let node = inner
                .nodes
                .get(value)
                .ok_or_else(|| anyhow!("missing node for value {:?}", value))?;
            nodes.push(StagedNode {
                value: *value,
                op: node.op.clone(),
                operands: node.operands.clone(),
                spec: node.spec.clone(),
            });
        }

        Ok(PlanOutcome::Stage(StagedSubgraph {
            nodes,
            parameters,
            outputs,
        }))
    }

    fn lower_plan(&self, staged: StagedSubgraph) -> Result<LoweredPlan> {
        let StagedSubgraph {
            nodes,
            parameters,
            outputs,
        } = staged;

        let mut builder = ProgramBuilder::new();
        let mut mapping: HashMap<ValueId, ValueId> = HashMap::new();

        for parameter in &parameters {
            let new_id = builder.add_parameter(ValueType::Tensor(parameter.spec.clone()));
            mapping.insert(parameter.value, new_id);
        }

        for node in &nodes {
            let mapped_operands = node
                .operands
                .iter()
                .map(|operand| remap_operand(&mapping, operand))
                .collect::<Result<Vec<_>>>()?;
            let new_id = builder.emit(
                node.op.clone(),
                mapped_operands,
                ValueType::Tensor(node.spec.clone()),
            );
            mapping.insert(node.value, new_id);
        }

        let result_ids = outputs
            .iter()
            .map(|original| {
                mapping
                    .get(original)
                    .copied()
                    .ok_or_else(|| anyhow!("missing mapping for output value {:?}", original))
            })
            .collect::<Result<Vec<_>>>()?;

        let function = builder.finish("captured", result_ids);
        let program = Arc::new(Program::new("captured").with_functions(vec![function]));

        Ok(LoweredPlan {
            program,
            parameter_values: parameters.iter().map(|parameter| parameter.value).collect(),
            outputs,
        })
    }

    fn collect_entry_inputs(&self, plan: &LoweredPlan) -> Result<Vec<B::TensorHandle>> {
        let inner = self.inner.lock().expect("graph arena poisoned");
        let mut handles = Vec::with_capacity(plan.parameter_values.len());
        for value in &plan.parameter_values {
            match ready_handle_of(&inner, *value)? {
                Some(handle) => handles.push(handle),
                None => {
                    return Err(anyhow!(
                        "input value {:?} pending while collecting entry inputs",
                        value
                    ));
                }
            }
        }
        Ok(handles)
    }

    fn execute_plan(
        &self,
        plan: &LoweredPlan,
        targets: &[ValueId],
        entry_inputs: Vec<B::TensorHandle>,
    ) -> Result<Vec<B::TensorHandle>> {
        let trace_sink = trace::current_sink();
        let context = ProgramContext {
            trace_id: trace::next_trace_id(),
            graph_id: Some(self.id),
            backend: self.backend.backend_name().to_string(),
            targets: targets.to_vec(),
            outputs: plan.outputs.clone(),
            timestamp: std::time::SystemTime::now(),
            kind: ProgramKind::Materialize {
                values: targets.to_vec(),
            },
        };
        if let Some(ref sink) = trace_sink {
            sink.before_program(&context, &plan.program);
        }

        let start = Instant::now();
        let report = |output_count: usize, status: ProgramStatus| {
            if let Some(ref sink) = trace_sink {
                sink.after_program(
                    &context,
                    &ProgramStats {
                        duration: start.elapsed(),
                        output_count,
                        status,
                    },
                );
            }
        };

        let mut produced = match self.backend.run_program(&plan.program, &entry_inputs) {
            Ok(produced) => produced,
            Err(err) => {
                report(
                    0,
                    ProgramStatus::Failure {
                        message: err.to_string(),
                    },
                );
                return Err(err.into());
            }
        };

        if produced.len() != plan.outputs.len() {
            let message = format!(
                "backend returned {} outputs, expected {}",
                produced.len(),
                plan.outputs.len()
            );
            report(
                produced.len(),
                ProgramStatus::Failure {
                    message: message.clone(),
                },
            );
            return Err(anyhow!(message));
        }

        let handles = {
            let mut inner = self.inner.lock().expect("graph arena poisoned");
            for (value_id, handle) in plan.outputs.iter().zip(produced.drain(..)) {
                if let Some(node) = inner.nodes.get_mut(value_id) {
                    node.state = NodeState::Ready(handle);
                }
            }
            collect_target_handles(&inner, targets)?
        };

        report(plan.outputs.len(), ProgramStatus::Success);
        Ok(handles)
    }
}

/// Ready handle for `value` if it has one, `None` while pending, error when
/// the value is unknown to this arena.
fn ready_handle_of<B: PortableBackend + 'static>(
    inner: &GraphInner<B>,
    value: ValueId,
) -> Result<Option<B::TensorHandle>> {
    if let Some(node) = inner.nodes.get(&value) {
        return Ok(match &node.state {
            NodeState::Ready(handle) => Some(handle.clone()),
            NodeState::Pending => None,
        });
    }
    match inner.import_for(value) {
        Some(record) => Ok(Some(record.handle.clone())),
        None => Err(anyhow!("value {:?} not registered in graph", value)),
    }
}

fn collect_target_handles<B: PortableBackend + 'static>(
    inner: &GraphInner<B>,
    targets: &[ValueId],
) -> Result<Vec<B::TensorHandle>> {
    targets
        .iter()
        .map(|value| {
            ready_handle_of(inner, *value)?
                .ok_or_else(|| anyhow!("value {value:?} pending after program execution"))
        })
        .collect()
}

fn remap_operand(mapping: &HashMap<ValueId, ValueId>, operand: &Operand) -> Result<Operand> {
    match operand {
        Operand::Value(src) => mapping
            .get(src)
            .copied()
            .map(Operand::Value)
            .ok_or_else(|| anyhow!("missing operand mapping for value {:?}", src)),
        Operand::TupleElement { tuple, index } => mapping
            .get(tuple)
            .copied()
            .map(|mapped| Operand::TupleElement {
                tuple: mapped,
                index: *index,
            })
            .ok_or_else(|| anyhow!("missing tuple mapping for value {:?}", tuple)),
        Operand::Literal(lit) => Ok(Operand::Literal(lit.clone())),
    }
}

enum PlanOutcome<B: PortableBackend + 'static> {
    AllReady(Vec<B::TensorHandle>),
    Stage(StagedSubgraph),
}

/// Pending node staged for lowering, captured outside the arena lock.
struct StagedNode {
    value: ValueId,
    op: Operation,
    operands: Vec<Operand>,
    spec: TensorSpec,
}

/// Program parameter binding: which arena value feeds the parameter and its spec.
struct PlanParameter {
    value: ValueId,
    spec: TensorSpec,
}

struct StagedSubgraph {
    nodes: Vec<StagedNode>,
    parameters: Vec<PlanParameter>,
    outputs: Vec<ValueId>,
}

struct LoweredPlan {
    program: Arc<Program>,
    parameter_values: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

/// Depth-first walk over the producers of `value`, splitting what it finds
/// into nodes to execute and ready values to bind as parameters.
fn classify_producers<B: PortableBackend + 'static>(
    inner: &GraphInner<B>,
    value: ValueId,
    pending: &mut HashSet<ValueId>,
    ready_inputs: &mut HashSet<ValueId>,
) -> Result<()> {
    if pending.contains(&value) || ready_inputs.contains(&value) {
        return Ok(());
    }

    let node = inner
        .nodes
        .get(&value)
        .ok_or_else(|| anyhow!("value {:?} not registered", value))?;

    if matches!(node.state, NodeState::Ready(_)) {
        ready_inputs.insert(value);
        return Ok(());
    }

    pending.insert(value);
    for operand in &node.operands {
        if let Operand::Value(dep) = operand {
            if inner.nodes.contains_key(dep) {
                classify_producers(inner, *dep, pending, ready_inputs)?;
            } else {
                ready_inputs.insert(*dep);
            }
        }
    }

    Ok(())
}

/// Collects the node closure feeding a region result, rejecting references that
/// escape the declared parameter list.
fn gather_region_nodes<B: PortableBackend + 'static>(
    inner: &GraphInner<B>,
    value: ValueId,
    params: &HashSet<ValueId>,
    needed: &mut HashSet<ValueId>,
) -> Result<()> {
    if params.contains(&value) || needed.contains(&value) {
        return Ok(());
    }

    let node = inner.nodes.get(&value).ok_or_else(|| {
        anyhow!(
            "region body references value {:?} outside its parameter list",
            value
        )
    })?;

    needed.insert(value);
    for operand in &node.operands {
        if let Operand::Value(dep) = operand {
            gather_region_nodes(inner, *dep, params, needed)?;
        }
    }

    Ok(())
}
