//! Reference interpreter for the portable IR on host memory.
//!
//! Tensors are dense `Arc` slices; every instruction runs eagerly when
//! `run_program` reaches it. The interceptor hook lets tests swap single
//! kernels without standing up a second backend.

use std::collections::HashMap;
use std::sync::Arc;

use loop_rs::backend::spec::{
    BackendError, BackendResult, BroadcastToSpec, CompareSpec, ComparisonOp, DType, Dimension,
    DotGeneralSpec, ElementwiseBinaryOp, ElementwiseUnaryOp, Instruction, Operand, Operation,
    PortableBackend, Program, RegionId, Shape, SpecErrorCode, TensorInit, TensorLiteral,
    TensorSpec, ValueId, ValueType, WhileSpec,
};

#[derive(Debug, Clone)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

impl CpuTensor {
    pub fn new(spec: TensorSpec, data: TensorData) -> Self {
        Self { spec, data }
    }
}

#[derive(Debug, Clone)]
pub enum TensorData {
    F32(Arc<[f32]>),
    Si32(Arc<[i32]>),
    Bool(Arc<[u8]>),
}

impl TensorData {
    fn zeroed(dtype: DType, len: usize) -> Option<TensorData> {
        match dtype {
            DType::F32 => Some(TensorData::F32(Arc::from(vec![0.0; len]))),
            DType::Si32 => Some(TensorData::Si32(Arc::from(vec![0; len]))),
            DType::I1 => Some(TensorData::Bool(Arc::from(vec![0; len]))),
            _ => None,
        }
    }

    fn broadcast(&self, from: &[usize], to: &[usize]) -> TensorData {
        match self {
            TensorData::F32(values) => {
                TensorData::F32(Arc::from(broadcast_values(values, from, to)))
            }
            TensorData::Si32(values) => {
                TensorData::Si32(Arc::from(broadcast_values(values, from, to)))
            }
            TensorData::Bool(values) => {
                TensorData::Bool(Arc::from(broadcast_values(values, from, to)))
            }
        }
    }
}

/// SSA value during program evaluation. Tuples exist only between `tuple`,
/// `while`, and `get_tuple_element` instructions; kernels see plain tensors.
#[derive(Clone)]
enum CpuValue {
    Tensor(CpuTensor),
    Tuple(Vec<CpuTensor>),
}

/// Hook consulted before every kernel dispatch. Returning `None` falls
/// through to the built-in implementation.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        op: &Operation,
        inputs: &[CpuTensor],
        outputs: &[TensorSpec],
    ) -> Option<BackendResult<Vec<CpuTensor>>>;
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _op: &Operation,
        _inputs: &[CpuTensor],
        _outputs: &[TensorSpec],
    ) -> Option<BackendResult<Vec<CpuTensor>>> {
        None
    }
}

#[derive(Clone)]
pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuPortableBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor> PortableBackend for GenericCpuBackend<I> {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-portable"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        match init {
            TensorInit::Literal(lit) => decode_literal(&lit),
            TensorInit::Zeroed(spec) => alloc_zeroed(&spec),
        }
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        encode_literal(tensor)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        execute_operation(self.interceptor.as_ref(), instruction, inputs)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        let function = program
            .functions
            .iter()
            .find(|candidate| candidate.name == program.entry)
            .ok_or_else(|| BackendError::execution("entry function not found"))?;

        if function.parameter_ids.len() != entry_inputs.len() {
            return Err(BackendError::execution("entry input arity mismatch"));
        }

        let mut values = bind_parameters(&function.parameter_ids, entry_inputs);
        for (instr_index, instruction) in function.body.iter().enumerate() {
            run_instruction(
                self.interceptor.as_ref(),
                program,
                &function.name,
                &mut values,
                instr_index,
                instruction,
            )?;
        }

        collect_results(&values, &function.result_ids, "entry")
    }
}

fn bind_parameters(ids: &[ValueId], args: &[CpuTensor]) -> HashMap<ValueId, CpuValue> {
    let mut values = HashMap::new();
    for (id, arg) in ids.iter().zip(args) {
        values.insert(*id, CpuValue::Tensor(arg.clone()));
    }
    values
}

fn collect_results(
    values: &HashMap<ValueId, CpuValue>,
    ids: &[ValueId],
    scope: &str,
) -> BackendResult<Vec<CpuTensor>> {
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        match values.get(id) {
            Some(CpuValue::Tensor(tensor)) => results.push(tensor.clone()),
            Some(CpuValue::Tuple(_)) => {
                return Err(BackendError::execution(format!(
                    "{scope} results must be tensors"
                )));
            }
            None => {
                return Err(BackendError::execution(format!(
                    "missing {scope} result value"
                )));
            }
        }
    }
    Ok(results)
}

/// Evaluates one instruction into the SSA environment. Structural ops
/// (`tuple`, `get_tuple_element`, `while`) are handled here because they need
/// the environment and, for `while`, the surrounding program's regions;
/// everything else goes through the tensor kernel dispatch.
fn run_instruction(
    interceptor: &dyn CpuKernelInterceptor,
    program: &Program,
    scope: &str,
    values: &mut HashMap<ValueId, CpuValue>,
    instr_index: usize,
    instruction: &Instruction,
) -> BackendResult<()> {
    match &instruction.op {
        Operation::Tuple => {
            let elements = instruction
                .operands
                .iter()
                .map(|operand| resolve_tensor(values, operand))
                .collect::<BackendResult<Vec<_>>>()?;
            values.insert(instruction.id, CpuValue::Tuple(elements));
            Ok(())
        }
        Operation::GetTupleElement(spec) => {
            let operand = match instruction.operands.as_slice() {
                [operand] => operand,
                _ => {
                    return Err(BackendError::execution(
                        "get_tuple_element expects one operand",
                    ));
                }
            };
            let elements = resolve_tuple(values, operand)?;
            let element = elements.get(spec.index).cloned().ok_or_else(|| {
                BackendError::spec(
                    SpecErrorCode::TupleIndexOutOfBounds,
                    format!(
                        "index {} out of bounds for tuple of {} elements",
                        spec.index,
                        elements.len()
                    ),
                )
            })?;
            values.insert(instruction.id, CpuValue::Tensor(element));
            Ok(())
        }
        Operation::While(spec) => {
            let operand = match instruction.operands.as_slice() {
                [operand] => operand,
                _ => return Err(BackendError::execution("while expects one tuple operand")),
            };
            let seed = resolve_tuple(values, operand)?;
            let finished = run_while(interceptor, program, spec, seed)?;
            values.insert(instruction.id, CpuValue::Tuple(finished));
            Ok(())
        }
        _ => {
            let kernel_inputs = instruction
                .operands
                .iter()
                .map(|operand| resolve_tensor(values, operand))
                .collect::<BackendResult<Vec<_>>>()?;
            let mut produced = execute_operation(interceptor, instruction, &kernel_inputs)
                .map_err(|err| {
                    annotate_failure(err, scope, instr_index, instruction, &kernel_inputs)
                })?;
            let result = match produced.pop() {
                Some(tensor) if produced.is_empty() => tensor,
                _ => {
                    return Err(BackendError::execution(
                        "instructions must produce exactly one result",
                    ));
                }
            };
            values.insert(instruction.id, CpuValue::Tensor(result));
            Ok(())
        }
    }
}

fn resolve_value(
    values: &HashMap<ValueId, CpuValue>,
    operand: &Operand,
) -> BackendResult<CpuValue> {
    match operand {
        Operand::Value(id) => values
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::execution("operand value missing")),
        Operand::TupleElement { tuple, index } => {
            let elements = match values.get(tuple) {
                Some(CpuValue::Tuple(elements)) => elements,
                Some(CpuValue::Tensor(_)) => {
                    return Err(BackendError::execution(
                        "tuple element operand refers to a tensor value",
                    ));
                }
                None => return Err(BackendError::execution("operand value missing")),
            };
            elements
                .get(*index)
                .cloned()
                .map(CpuValue::Tensor)
                .ok_or_else(|| {
                    BackendError::spec(
                        SpecErrorCode::TupleIndexOutOfBounds,
                        format!(
                            "index {index} out of bounds for tuple of {} elements",
                            elements.len()
                        ),
                    )
                })
        }
        Operand::Literal(lit) => Ok(CpuValue::Tensor(decode_literal(lit)?)),
    }
}

fn resolve_tensor(
    values: &HashMap<ValueId, CpuValue>,
    operand: &Operand,
) -> BackendResult<CpuTensor> {
    match resolve_value(values, operand)? {
        CpuValue::Tensor(tensor) => Ok(tensor),
        CpuValue::Tuple(_) => Err(BackendError::execution(
            "expected a tensor operand, got a tuple",
        )),
    }
}

fn resolve_tuple(
    values: &HashMap<ValueId, CpuValue>,
    operand: &Operand,
) -> BackendResult<Vec<CpuTensor>> {
    match resolve_value(values, operand)? {
        CpuValue::Tuple(elements) => Ok(elements),
        CpuValue::Tensor(_) => Err(BackendError::execution(
            "expected a tuple operand, got a tensor",
        )),
    }
}

/// Runs the `while` loop to completion on the host interpreter.
///
/// Loop state keeps its per-slot specs across iterations; a body region that
/// changes a slot's dtype or shape aborts execution rather than silently
/// reinterpreting the data on the next cond evaluation.
fn run_while(
    interceptor: &dyn CpuKernelInterceptor,
    program: &Program,
    spec: &WhileSpec,
    seed: Vec<CpuTensor>,
) -> BackendResult<Vec<CpuTensor>> {
    let mut state = seed;
    loop {
        let verdict = run_region(interceptor, program, spec.cond_region, &state)?;
        if !read_predicate(&verdict)? {
            return Ok(state);
        }
        let next = run_region(interceptor, program, spec.body_region, &state)?;
        if next.len() != state.len() {
            return Err(BackendError::execution(format!(
                "while body produced {} values, expected {}",
                next.len(),
                state.len()
            )));
        }
        for (slot, (old, new)) in state.iter().zip(&next).enumerate() {
            if new.spec != old.spec {
                return Err(BackendError::execution(format!(
                    "while body changed the spec of slot {slot}: {:?} -> {:?}",
                    old.spec, new.spec
                )));
            }
        }
        state = next;
    }
}

fn run_region(
    interceptor: &dyn CpuKernelInterceptor,
    program: &Program,
    region_id: RegionId,
    args: &[CpuTensor],
) -> BackendResult<Vec<CpuTensor>> {
    let region = program.region(region_id).ok_or_else(|| {
        BackendError::execution(format!("region ^r{} not found in program", region_id.0))
    })?;
    if region.parameter_ids.len() != args.len() {
        return Err(BackendError::spec(
            SpecErrorCode::RegionSignatureMismatch,
            format!(
                "region ^r{} takes {} parameters, got {} arguments",
                region_id.0,
                region.parameter_ids.len(),
                args.len()
            ),
        ));
    }

    let mut values = bind_parameters(&region.parameter_ids, args);
    let scope = format!("^r{}", region_id.0);
    for (instr_index, instruction) in region.body.iter().enumerate() {
        run_instruction(
            interceptor,
            program,
            &scope,
            &mut values,
            instr_index,
            instruction,
        )?;
    }

    collect_results(&values, &region.result_ids, "region")
}

fn read_predicate(cond_out: &[CpuTensor]) -> BackendResult<bool> {
    let flag = match cond_out {
        [tensor] => tensor,
        _ => {
            return Err(BackendError::spec(
                SpecErrorCode::RegionSignatureMismatch,
                format!("cond region produced {} results, expected 1", cond_out.len()),
            ));
        }
    };
    if flag.spec.dtype != DType::I1 || element_count(&flag.spec.shape)? != 1 {
        return Err(BackendError::spec(
            SpecErrorCode::RegionSignatureMismatch,
            format!("cond region must produce a [1] x I1 predicate, got {:?}", flag.spec),
        ));
    }
    match &flag.data {
        TensorData::Bool(values) => Ok(values[0] != 0),
        _ => Err(BackendError::execution(
            "cond predicate payload is not boolean",
        )),
    }
}

fn decode_literal(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let data = match literal.spec.dtype {
        DType::F32 => TensorData::F32(Arc::from(decode_scalars(
            &literal.bytes,
            "f32",
            f32::from_le_bytes,
        )?)),
        DType::Si32 => TensorData::Si32(Arc::from(decode_scalars(
            &literal.bytes,
            "i32",
            i32::from_le_bytes,
        )?)),
        DType::I1 => TensorData::Bool(Arc::from(literal.bytes.to_vec())),
        other => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!("literal dtype {other:?} unsupported"),
            ));
        }
    };
    Ok(CpuTensor::new(literal.spec.clone(), data))
}

fn alloc_zeroed(spec: &TensorSpec) -> BackendResult<CpuTensor> {
    let len = element_count(&spec.shape)?;
    let data = TensorData::zeroed(spec.dtype, len).ok_or_else(|| {
        BackendError::spec(
            SpecErrorCode::DTypeNotSupported,
            format!("zero init dtype {:?} unsupported", spec.dtype),
        )
    })?;
    Ok(CpuTensor::new(spec.clone(), data))
}

fn encode_literal(tensor: &CpuTensor) -> BackendResult<TensorLiteral> {
    let bytes = match &tensor.data {
        TensorData::F32(values) => encode_scalars(values, f32::to_le_bytes),
        TensorData::Si32(values) => encode_scalars(values, i32::to_le_bytes),
        TensorData::Bool(values) => Arc::clone(values),
    };
    Ok(TensorLiteral::new(tensor.spec.clone(), bytes))
}

fn execute_operation(
    interceptor: &dyn CpuKernelInterceptor,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendResult<Vec<CpuTensor>> {
    let ValueType::Tensor(output_spec) = &instruction.output else {
        return Err(BackendError::execution(
            "tuple-typed instructions must be evaluated by run_program",
        ));
    };
    let output_specs = [output_spec.clone()];

    if let Some(result) = interceptor.try_execute(&instruction.op, inputs, &output_specs) {
        return result;
    }

    let result = match &instruction.op {
        Operation::Constant(literal) => vec![decode_literal(literal)?],
        Operation::BroadcastTo(spec) => vec![op_broadcast_to(inputs, &output_specs[0], spec)?],
        Operation::DotGeneral(spec) => vec![op_dot_general(inputs, &output_specs[0], spec)?],
        Operation::ElementwiseBinary(op) => {
            vec![op_elementwise_binary(inputs, &output_specs[0], *op)?]
        }
        Operation::ElementwiseUnary(op) => {
            vec![op_elementwise_unary(inputs, &output_specs[0], *op)?]
        }
        Operation::Compare(spec) => vec![op_compare(inputs, &output_specs[0], spec)?],
        Operation::Tuple | Operation::GetTupleElement(_) | Operation::While(_) => {
            return Err(BackendError::execution(
                "structural ops must be evaluated by run_program",
            ));
        }
    };
    Ok(result)
}

fn annotate_failure(
    error: BackendError,
    scope: &str,
    instruction_index: usize,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendError {
    let context = format!(
        "`{scope}` instruction #{instruction_index}, {} id {:?} operands [{}]",
        operation_label(&instruction.op),
        instruction.id,
        describe_operands(&instruction.operands, inputs)
    );
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!("{message} (at {context})"),
        },
        BackendError::Unimplemented { op, reason } => BackendError::Unimplemented {
            op,
            reason: format!("{reason} (while executing {context})"),
        },
        other => other,
    }
}

fn describe_operands(operands: &[Operand], inputs: &[CpuTensor]) -> String {
    let parts: Vec<String> = operands
        .iter()
        .zip(inputs)
        .map(|(operand, tensor)| describe_operand(operand, tensor))
        .collect();
    if parts.is_empty() {
        String::from("<none>")
    } else {
        parts.join(", ")
    }
}

fn describe_operand(operand: &Operand, tensor: &CpuTensor) -> String {
    let shape_desc = match static_dims(&tensor.spec.shape) {
        Ok(dims) if dims.is_empty() => String::from("[]"),
        Ok(dims) => format!(
            "[{}]",
            dims.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("x")
        ),
        Err(_) => String::from("dynamic"),
    };
    let dtype_desc = format!("{:?}", tensor.spec.dtype);

    match operand {
        Operand::Value(id) => format!("value {id:?} {shape_desc} dtype={dtype_desc}"),
        Operand::Literal(_) => format!("literal {shape_desc} dtype={dtype_desc}"),
        Operand::TupleElement { tuple, index } => {
            format!("tuple {tuple:?}[{index}] {shape_desc} dtype={dtype_desc}")
        }
    }
}

fn operation_label(op: &Operation) -> &'static str {
    match op {
        Operation::Constant(_) => "constant",
        Operation::ElementwiseUnary(_) => "elementwise_unary",
        Operation::ElementwiseBinary(_) => "elementwise_binary",
        Operation::DotGeneral(_) => "dot_general",
        Operation::Compare(_) => "compare",
        Operation::BroadcastTo(_) => "broadcast_to",
        Operation::Tuple => "tuple",
        Operation::GetTupleElement(_) => "get_tuple_element",
        Operation::While(_) => "while",
    }
}

fn op_broadcast_to(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &BroadcastToSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let input_dims = static_dims(&input.spec.shape)?;
    let out_dims = static_dims(&output.shape)?;
    if out_dims != static_dims(&spec.result_shape)? {
        return Err(BackendError::execution(
            "broadcast_to result shape mismatch",
        ));
    }
    if out_dims.len() < input_dims.len() {
        return Err(BackendError::spec(
            SpecErrorCode::BroadcastRankMismatch,
            "broadcast_to result rank must be >= operand rank".to_string(),
        ));
    }
    let pad = out_dims.len() - input_dims.len();
    for (axis, &extent) in input_dims.iter().enumerate() {
        if extent != 1 && extent != out_dims[pad + axis] {
            return Err(BackendError::execution("broadcast_to dim mismatch"));
        }
    }
    Ok(CpuTensor::new(
        output.clone(),
        input.data.broadcast(&input_dims, &out_dims),
    ))
}

fn broadcast_values<T: Copy>(input: &[T], input_dims: &[usize], out_dims: &[usize]) -> Vec<T> {
    if input_dims == out_dims {
        return input.to_vec();
    }
    let pad = out_dims.len().saturating_sub(input_dims.len());
    let mut source_dims = vec![1usize; out_dims.len()];
    source_dims[pad..].copy_from_slice(input_dims);
    let source_strides = row_major_strides(&source_dims);

    let mut out = Vec::with_capacity(out_dims.iter().product());
    for coords in Odometer::over(out_dims) {
        let mut offset = 0usize;
        for (axis, &coord) in coords.iter().enumerate() {
            if source_dims[axis] > 1 {
                offset += coord * source_strides[axis];
            }
        }
        out.push(input[offset]);
    }
    out
}

/// Axis bookkeeping for one side of a `dot_general`. Free axes are whatever
/// the attribute left unclassified, in ascending order; that order also fixes
/// the row-major layout of the output.
struct DotSide {
    strides: Vec<usize>,
    batch: Vec<usize>,
    contract: Vec<usize>,
    free: Vec<usize>,
    free_shape: Vec<usize>,
}

impl DotSide {
    fn classify(dims: &[usize], batch_axes: &[usize], contract_axes: &[usize]) -> Self {
        let mut batch = batch_axes.to_vec();
        batch.sort_unstable();
        let contract = contract_axes.to_vec();
        let free: Vec<usize> = (0..dims.len())
            .filter(|axis| !batch.contains(axis) && !contract.contains(axis))
            .collect();
        let free_shape = free.iter().map(|&axis| dims[axis]).collect();
        Self {
            strides: row_major_strides(dims),
            batch,
            contract,
            free,
            free_shape,
        }
    }

    fn offset(&self, batch: &[usize], free: &[usize], contract: &[usize]) -> usize {
        axis_offset(&self.strides, &self.batch, batch)
            + axis_offset(&self.strides, &self.free, free)
            + axis_offset(&self.strides, &self.contract, contract)
    }
}

fn axis_offset(strides: &[usize], axes: &[usize], coords: &[usize]) -> usize {
    axes.iter()
        .zip(coords)
        .map(|(&axis, &coord)| coord * strides[axis])
        .sum()
}

fn op_dot_general(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &DotGeneralSpec,
) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs, "dot_general expects two inputs")?;
    if !matches!(spec.accum_dtype, None | Some(DType::F32)) {
        return Err(BackendError::unimplemented(
            "dot_general",
            "accum_dtype override not supported",
        ));
    }
    match spec.out_dtype {
        Some(dtype) if dtype != output.dtype => {
            return Err(BackendError::execution("dot_general out_dtype mismatch"));
        }
        Some(dtype) if dtype != DType::F32 => {
            return Err(BackendError::unimplemented(
                "dot_general",
                "out_dtype not supported",
            ));
        }
        _ => {}
    }
    let (lhs_values, rhs_values) = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => (a.as_ref(), b.as_ref()),
        _ => {
            return Err(BackendError::execution(
                "dot_general only supports f32 tensors",
            ));
        }
    };
    if output.dtype != DType::F32 {
        return Err(BackendError::execution(
            "dot_general only supports f32 output",
        ));
    }

    let lhs_dims = static_dims(&lhs.spec.shape)?;
    let rhs_dims = static_dims(&rhs.spec.shape)?;
    let lhs_side = DotSide::classify(&lhs_dims, &spec.batch_lhs, &spec.contract_lhs);
    let rhs_side = DotSide::classify(&rhs_dims, &spec.batch_rhs, &spec.contract_rhs);
    let batch_shape: Vec<usize> = lhs_side.batch.iter().map(|&axis| lhs_dims[axis]).collect();
    let contract_shape: Vec<usize> = lhs_side
        .contract
        .iter()
        .map(|&axis| lhs_dims[axis])
        .collect();

    let mut acc = vec![0.0f32; element_count(&output.shape)?];
    let mut cursor = 0usize;
    for batch in Odometer::over(&batch_shape) {
        for row in Odometer::over(&lhs_side.free_shape) {
            for col in Odometer::over(&rhs_side.free_shape) {
                let mut sum = 0.0f32;
                for k in Odometer::over(&contract_shape) {
                    sum += lhs_values[lhs_side.offset(&batch, &row, &k)]
                        * rhs_values[rhs_side.offset(&batch, &col, &k)];
                }
                acc[cursor] = sum;
                cursor += 1;
            }
        }
    }

    Ok(CpuTensor::new(
        output.clone(),
        TensorData::F32(Arc::from(acc)),
    ))
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseBinaryOp,
) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs, "elementwise binary expects 2 inputs")?;
    let data = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            let values = zip_elementwise(a, b, |x, y| {
                Ok(match op {
                    ElementwiseBinaryOp::Add => x + y,
                    ElementwiseBinaryOp::Sub => x - y,
                    ElementwiseBinaryOp::Mul => x * y,
                    ElementwiseBinaryOp::Div => x / y,
                    ElementwiseBinaryOp::Maximum => x.max(y),
                    ElementwiseBinaryOp::Minimum => x.min(y),
                })
            })?;
            TensorData::F32(Arc::from(values))
        }
        (TensorData::Si32(a), TensorData::Si32(b)) => {
            let values = zip_elementwise(a, b, |x, y| {
                Ok(match op {
                    ElementwiseBinaryOp::Add => x.wrapping_add(y),
                    ElementwiseBinaryOp::Sub => x.wrapping_sub(y),
                    ElementwiseBinaryOp::Mul => x.wrapping_mul(y),
                    ElementwiseBinaryOp::Div => {
                        if y == 0 {
                            return Err(BackendError::execution("integer division by zero"));
                        }
                        x.wrapping_div(y)
                    }
                    ElementwiseBinaryOp::Maximum => x.max(y),
                    ElementwiseBinaryOp::Minimum => x.min(y),
                })
            })?;
            TensorData::Si32(Arc::from(values))
        }
        _ => {
            return Err(BackendError::execution(
                "elementwise binary supports f32 and si32 tensors",
            ));
        }
    };
    Ok(CpuTensor::new(output.clone(), data))
}

fn zip_elementwise<T: Copy, R>(
    a: &[T],
    b: &[T],
    mut combine: impl FnMut(T, T) -> BackendResult<R>,
) -> BackendResult<Vec<R>> {
    if a.len() != b.len() {
        return Err(BackendError::execution("elementwise size mismatch"));
    }
    let mut out = Vec::with_capacity(a.len());
    for (&x, &y) in a.iter().zip(b.iter()) {
        out.push(combine(x, y)?);
    }
    Ok(out)
}

fn op_elementwise_unary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseUnaryOp,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let values = match &input.data {
        TensorData::F32(values) => values,
        _ => {
            return Err(BackendError::execution(
                "elementwise unary only supports f32 tensors",
            ));
        }
    };

    let mapped: Vec<f32> = match op {
        ElementwiseUnaryOp::Neg => values.iter().map(|&x| -x).collect(),
        ElementwiseUnaryOp::Abs => values.iter().map(|&x| x.abs()).collect(),
    };

    Ok(CpuTensor::new(
        output.clone(),
        TensorData::F32(Arc::from(mapped)),
    ))
}

fn op_compare(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &CompareSpec,
) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs, "compare expects two inputs")?;
    let flags = match (&lhs.data, &rhs.data) {
        (TensorData::Si32(a), TensorData::Si32(b)) => compare_slices(spec.op, a, b)?,
        (TensorData::F32(a), TensorData::F32(b)) => compare_slices(spec.op, a, b)?,
        _ => {
            return Err(BackendError::execution(
                "compare supports si32 and f32 tensors",
            ));
        }
    };
    Ok(CpuTensor::new(
        output.clone(),
        TensorData::Bool(Arc::from(flags)),
    ))
}

fn compare_slices<T: PartialOrd + Copy>(
    op: ComparisonOp,
    a: &[T],
    b: &[T],
) -> BackendResult<Vec<u8>> {
    if a.len() != b.len() {
        return Err(BackendError::spec(
            SpecErrorCode::CompareOperandsMustMatchShape,
            format!("lhs has {} elements, rhs has {}", a.len(), b.len()),
        ));
    }
    Ok(a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| u8::from(predicate_holds(op, x, y)))
        .collect())
}

fn predicate_holds<T: PartialOrd>(op: ComparisonOp, x: T, y: T) -> bool {
    match op {
        ComparisonOp::Less => x < y,
        ComparisonOp::LessEqual => x <= y,
        ComparisonOp::Equal => x == y,
        ComparisonOp::GreaterEqual => x >= y,
        ComparisonOp::Greater => x > y,
        ComparisonOp::NotEqual => x != y,
    }
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    match inputs {
        [input] => Ok(input),
        _ => Err(BackendError::execution("operation expects single input")),
    }
}

fn expect_pair<'t>(
    inputs: &'t [CpuTensor],
    message: &str,
) -> BackendResult<(&'t CpuTensor, &'t CpuTensor)> {
    match inputs {
        [lhs, rhs] => Ok((lhs, rhs)),
        _ => Err(BackendError::execution(message)),
    }
}

fn static_dims(shape: &Shape) -> BackendResult<Vec<usize>> {
    let mut dims = Vec::with_capacity(shape.rank());
    for dim in shape.dims() {
        match dim {
            Dimension::Static(extent) => dims.push(*extent),
            Dimension::Dynamic(symbol) => {
                return Err(BackendError::execution(format!(
                    "dynamic dimension {} not supported at runtime",
                    symbol.as_str()
                )));
            }
        }
    }
    Ok(dims)
}

fn element_count(shape: &Shape) -> BackendResult<usize> {
    Ok(static_dims(shape)?.into_iter().product())
}

fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

fn decode_scalars<T>(
    bytes: &[u8],
    label: &str,
    decode: impl Fn([u8; 4]) -> T,
) -> BackendResult<Vec<T>> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::execution(format!(
            "literal byte length mismatches {label}"
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| decode([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn encode_scalars<T: Copy>(values: &[T], encode: impl Fn(T) -> [u8; 4]) -> Arc<[u8]> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &value in values {
        bytes.extend_from_slice(&encode(value));
    }
    Arc::from(bytes.into_boxed_slice())
}

/// Row-major walk over an n-dimensional index space. A rank-0 space yields
/// one empty coordinate list; a space with any zero extent yields nothing.
struct Odometer {
    extents: Vec<usize>,
    coords: Vec<usize>,
    done: bool,
}

impl Odometer {
    fn over(extents: &[usize]) -> Self {
        Self {
            extents: extents.to_vec(),
            coords: vec![0; extents.len()],
            done: extents.iter().any(|&extent| extent == 0),
        }
    }
}

impl Iterator for Odometer {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let snapshot = self.coords.clone();
        self.done = true;
        for axis in (0..self.coords.len()).rev() {
            self.coords[axis] += 1;
            if self.coords[axis] < self.extents[axis] {
                self.done = false;
                break;
            }
            self.coords[axis] = 0;
        }
        Some(snapshot)
    }
}
