use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::{fmt, fs, io};

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// LTIR version stamped into every program; load paths reject anything else.
pub const SPEC_VERSION: &str = "ltir.v0.1";

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// Scalar element types a backend must understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    I1,
    Si32,
    Bf16,
    F16,
    F32,
}

impl DType {
    /// `true` for the floating-point members.
    pub fn is_float(self) -> bool {
        matches!(self, DType::Bf16 | DType::F16 | DType::F32)
    }

    /// Bytes one element occupies in a dense literal.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Bf16 | DType::F16 => 2,
            DType::Si32 | DType::F32 => 4,
        }
    }
}

/// Name of a dynamic dimension, printed as `?B`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        DimSymbol(Arc::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(DimSymbol::new(String::deserialize(deserializer)?))
    }
}

/// One axis extent, either a known size or a named symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

/// Ordered dimension list of a tensor value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Concrete extents, or `None` while any axis is symbolic.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims
            .iter()
            .map(|dim| match dim {
                Dimension::Static(value) => Some(*value),
                Dimension::Dynamic(_) => None,
            })
            .collect()
    }

    /// Element count for fully static shapes; `None` on symbols or overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.static_dims()?
            .into_iter()
            .try_fold(1usize, |count, dim| count.checked_mul(dim))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("[]");
        }
        for (position, dim) in self.dims.iter().enumerate() {
            if position > 0 {
                f.write_str("x")?;
            }
            match dim {
                Dimension::Static(extent) => write!(f, "{extent}")?,
                Dimension::Dynamic(symbol) => write!(f, "?{}", symbol.as_str())?,
            }
        }
        Ok(())
    }
}

/// Dtype plus shape, the full description of one tensor slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Element count when the shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Dense byte length when the shape is fully static.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size_in_bytes())
    }
}

/// Spec plus dense little-endian bytes; how tensor data crosses the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct RawLiteral {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let raw = RawLiteral::deserialize(deserializer)?;
        Ok(TensorLiteral::new(raw.spec, Arc::from(raw.bytes)))
    }
}

/// What [`PortableBackend::materialize`] starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TensorInit {
    Literal(TensorLiteral),
    Zeroed(TensorSpec),
}

/// Predicate evaluated elementwise by `compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
}

/// Unary elementwise operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Abs,
}

/// Binary elementwise operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

/// Axis assignment for a `dot_general` contraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotGeneralSpec {
    pub contract_lhs: Vec<usize>,
    pub contract_rhs: Vec<usize>,
    pub batch_lhs: Vec<usize>,
    pub batch_rhs: Vec<usize>,
    pub accum_dtype: Option<DType>,
    pub out_dtype: Option<DType>,
}

/// Attribute payload for `compare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareSpec {
    pub op: ComparisonOp,
}

/// Attribute payload for `broadcast_to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastToSpec {
    pub result_shape: Shape,
}

/// Attribute payload for `get_tuple_element`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GetTupleElementSpec {
    pub index: usize,
}

/// Index of a region in [`Program::regions`], printed as `^rN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionId(pub usize);

/// Control-flow payload for `while`.
///
/// The loop takes a single tuple operand. The cond region maps the tuple's
/// element list to a `[1] x I1` predicate; the body region maps it to a new
/// tuple-element list of identical arity and per-position spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhileSpec {
    pub cond_region: RegionId,
    pub body_region: RegionId,
}

/// SSA value identifier, unique within one function or region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Type of an SSA value: a tensor or a tuple of nested values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Tuple(Vec<ValueType>),
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(spec) => {
                write!(f, "tensor<{:?} x {}>", spec.dtype, spec.shape)
            }
            ValueType::Tuple(elements) => {
                f.write_str("tuple<")?;
                for (position, element) in elements.iter().enumerate() {
                    if position > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str(">")
            }
        }
    }
}

/// How an instruction names one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    TupleElement { tuple: ValueId, index: usize },
    Literal(TensorLiteral),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(id) => write!(f, "%{}", id.0),
            Operand::TupleElement { tuple, index } => write!(f, "%{}[{}]", tuple.0, index),
            Operand::Literal(literal) => write!(
                f,
                "literal(dtype={:?}, shape={})",
                literal.spec.dtype, literal.spec.shape
            ),
        }
    }
}

/// Operator of one instruction, with its attribute payload inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    DotGeneral(DotGeneralSpec),
    Compare(CompareSpec),
    BroadcastTo(BroadcastToSpec),
    Tuple,
    GetTupleElement(GetTupleElementSpec),
    While(WhileSpec),
}

/// One SSA assignment: `%id = op(operands) -> output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: ValueType,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{} = {:?}", self.id.0, self.op)?;
        if !self.operands.is_empty() {
            f.write_str("(")?;
            for (position, operand) in self.operands.iter().enumerate() {
                if position > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{operand}")?;
            }
            f.write_str(")")?;
        }
        write!(f, " -> {}", self.output)
    }
}

/// Body attached to a control-flow instruction.
///
/// Regions declare their own parameter list with explicit value ids, so body
/// instructions can reference parameters the same way function bodies do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub parameters: Vec<ValueType>,
    pub parameter_ids: Vec<ValueId>,
    pub body: Vec<Instruction>,
    pub results: Vec<ValueType>,
    pub result_ids: Vec<ValueId>,
}

/// Named entry point or helper computation of a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<ValueType>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<ValueType>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
}

/// A complete LTIR module: functions plus the regions their loops reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    pub entry: String,
    pub functions: Vec<Function>,
    pub regions: Vec<Region>,
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
            regions: Vec::new(),
        }
    }

    /// The region registered under `id`, if any.
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.iter().find(|region| region.id == id)
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let program: Program = serde_json::from_str(src)?;
        program.checked_version()
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ProgramSerdeError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, ProgramSerdeError> {
        let program: Program = bincode::deserialize(bytes)?;
        program.checked_version()
    }

    /// Empty versions normalize to the current one; anything else must match.
    fn checked_version(mut self) -> Result<Self, ProgramSerdeError> {
        if self.spec_version.is_empty() {
            self.spec_version = SPEC_VERSION.to_string();
        } else if self.spec_version != SPEC_VERSION {
            return Err(ProgramSerdeError::SpecVersionMismatch {
                found: self.spec_version,
                expected: SPEC_VERSION,
            });
        }
        Ok(self)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ProgramIoError> {
        Ok(fs::write(path, self.to_json_string()?)?)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ProgramIoError> {
        Ok(Program::from_json_str(&fs::read_to_string(path)?)?)
    }

    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> Result<(), ProgramIoError> {
        Ok(fs::write(path, self.to_bincode_bytes()?)?)
    }

    pub fn load_bincode<P: AsRef<Path>>(path: P) -> Result<Self, ProgramIoError> {
        Ok(Program::from_bincode_slice(&fs::read(path)?)?)
    }
}

/// Failure while encoding or decoding a [`Program`].
#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("program spec version '{found}' does not match expected '{expected}'")]
    SpecVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

/// Failure while reading or writing a [`Program`] file.
#[derive(Debug, Error)]
pub enum ProgramIoError {
    #[error(transparent)]
    Serialization(#[from] ProgramSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        indented(
            f,
            0,
            format_args!(
                "program @{} (spec_version = {}) {{",
                self.entry, self.spec_version
            ),
        )?;
        for function in &self.functions {
            indented(f, 1, format_args!("func @{} {{", function.name))?;
            typed_id_block(f, 2, "params:", &function.parameter_ids, &function.parameters)?;
            instruction_block(f, 2, &function.body)?;
            typed_id_block(f, 2, "results:", &function.result_ids, &function.results)?;
            indented(f, 1, "}")?;
        }
        for region in &self.regions {
            indented(f, 1, format_args!("region ^r{} {{", region.id.0))?;
            typed_id_block(f, 2, "params:", &region.parameter_ids, &region.parameters)?;
            instruction_block(f, 2, &region.body)?;
            typed_id_block(f, 2, "results:", &region.result_ids, &region.results)?;
            indented(f, 1, "}")?;
        }
        indented(f, 0, "}")
    }
}

fn indented(f: &mut fmt::Formatter<'_>, depth: usize, line: impl fmt::Display) -> fmt::Result {
    for _ in 0..depth {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

fn typed_id_block(
    f: &mut fmt::Formatter<'_>,
    depth: usize,
    label: &str,
    ids: &[ValueId],
    types: &[ValueType],
) -> fmt::Result {
    if ids.is_empty() {
        return Ok(());
    }
    indented(f, depth, label)?;
    for (id, ty) in ids.iter().zip(types) {
        indented(f, depth + 1, format_args!("%{} : {ty}", id.0))?;
    }
    Ok(())
}

fn instruction_block(f: &mut fmt::Formatter<'_>, depth: usize, body: &[Instruction]) -> fmt::Result {
    if body.is_empty() {
        return Ok(());
    }
    indented(f, depth, "body:")?;
    for instruction in body {
        indented(f, depth + 1, instruction)?;
    }
    Ok(())
}

/// Incrementally assembles one function or region body, tracking value types
/// so result signatures come out consistent.
#[derive(Default)]
pub struct ProgramBuilder {
    next_value: u32,
    parameters: Vec<(ValueId, ValueType)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, ValueType>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self, ty: ValueType) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        self.value_types.insert(id, ty);
        id
    }

    pub fn add_parameter(&mut self, ty: ValueType) -> ValueId {
        let id = self.fresh(ty.clone());
        self.parameters.push((id, ty));
        id
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<Operand>, output: ValueType) -> ValueId {
        let id = self.fresh(output.clone());
        let instruction = Instruction {
            id,
            op,
            operands,
            output,
        };
        self.instructions.push(instruction);
        id
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.value_types.get(&id)
    }

    fn resolved_results(&self, result_ids: &[ValueId]) -> Vec<ValueType> {
        result_ids
            .iter()
            .map(|id| self.value_type(*id).expect("result value id must have a recorded type"))
            .cloned()
            .collect()
    }

    pub fn finish(self, name: impl Into<String>, result_ids: Vec<ValueId>) -> Function {
        let results = self.resolved_results(&result_ids);
        let (parameter_ids, parameters) = self.parameters.into_iter().unzip();
        Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            result_ids,
        }
    }

    /// Like [`ProgramBuilder::finish`] but produces a [`Region`] for a loop.
    pub fn finish_region(self, id: RegionId, result_ids: Vec<ValueId>) -> Region {
        let results = self.resolved_results(&result_ids);
        let (parameter_ids, parameters) = self.parameters.into_iter().unzip();
        Region {
            id,
            parameters,
            parameter_ids,
            body: self.instructions,
            results,
            result_ids,
        }
    }
}

/// Closed set of validation failures a backend may raise before executing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpecErrorCode {
    DTypeNotSupported,
    InvalidAttributeValue,
    CompareOperandsMustMatchShape,
    BroadcastRankMismatch,
    TupleIndexOutOfBounds,
    RegionSignatureMismatch,
    Unspecified(&'static str),
}

impl SpecErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecErrorCode::DTypeNotSupported => "SpecError: dtype not supported for op",
            SpecErrorCode::InvalidAttributeValue => "SpecError: invalid attribute value",
            SpecErrorCode::CompareOperandsMustMatchShape => {
                "SpecError: compare operands must match shape"
            }
            SpecErrorCode::BroadcastRankMismatch => "SpecError: broadcast rank mismatch",
            SpecErrorCode::TupleIndexOutOfBounds => "SpecError: tuple index out of bounds",
            SpecErrorCode::RegionSignatureMismatch => "SpecError: region signature mismatch",
            SpecErrorCode::Unspecified(code) => code,
        }
    }
}

/// A [`SpecErrorCode`] with optional free-form context.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecError {
    pub code: SpecErrorCode,
    pub detail: Option<String>,
}

impl SpecError {
    pub fn new(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        SpecError {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code.as_str())?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for SpecError {}

/// What a backend reports when it cannot produce a result.
#[derive(Debug)]
pub enum BackendError {
    SpecViolation(SpecError),
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn spec(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        BackendError::SpecViolation(SpecError::new(code, detail))
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::SpecViolation(err) => write!(f, "{err}"),
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;

/// The contract every execution target implements.
pub trait PortableBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Short identifier such as `"cpu"`, used in logs and error messages.
    fn backend_name(&self) -> &str;

    /// Uploads host data, returning the backend's handle for it.
    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle>;

    /// Copies a handle back to the host as a dense literal.
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Runs one instruction over already materialised operand handles.
    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;

    /// Runs a whole program from its entry function.
    ///
    /// Programs containing `While` instructions run to completion inside this
    /// call; the backend returns only when every entry result is finished.
    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;
}
