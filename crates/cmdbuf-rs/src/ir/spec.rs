use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Execution thread assigned to computations that do not name one.
pub const DEFAULT_EXECUTION_THREAD: &str = "main";

fn default_execution_thread() -> String {
    DEFAULT_EXECUTION_THREAD.to_string()
}

/// Enumerates scalar element types understood by the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    Bf16,
    F16,
    F32,
    F64,
}

impl DType {
    /// Returns the size in bytes of a single element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 | DType::Si8 | DType::Ui8 => 1,
            DType::Si16 | DType::Ui16 | DType::Bf16 | DType::F16 => 2,
            DType::Si32 | DType::Ui32 | DType::F32 => 4,
            DType::Si64 | DType::Ui64 | DType::F64 => 8,
        }
    }

    /// Lower-case mnemonic used by the text format.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::I1 => "i1",
            DType::Si8 => "si8",
            DType::Ui8 => "ui8",
            DType::Si16 => "si16",
            DType::Ui16 => "ui16",
            DType::Si32 => "si32",
            DType::Ui32 => "ui32",
            DType::Si64 => "si64",
            DType::Ui64 => "ui64",
            DType::Bf16 => "bf16",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

/// Logical tensor shape as an ordered list of extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the element count, or `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |count, dim| count.checked_mul(*dim))
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Returns the total byte length, or `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.shape
            .element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }
}

/// Dense literal tensor payload stored as little-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns the repeated f32 value when the literal is an f32 splat.
    pub fn f32_splat(&self) -> Option<f32> {
        if self.spec.dtype != DType::F32 || self.bytes.is_empty() || self.bytes.len() % 4 != 0 {
            return None;
        }
        let first: [u8; 4] = self.bytes[..4].try_into().ok()?;
        if self.bytes.chunks_exact(4).all(|chunk| chunk == first) {
            Some(f32::from_le_bytes(first))
        } else {
            None
        }
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Elementwise unary ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Tanh,
    Rsqrt,
}

impl ElementwiseUnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementwiseUnaryOp::Neg => "neg",
            ElementwiseUnaryOp::Abs => "abs",
            ElementwiseUnaryOp::Exp => "exp",
            ElementwiseUnaryOp::Log => "log",
            ElementwiseUnaryOp::Tanh => "tanh",
            ElementwiseUnaryOp::Rsqrt => "rsqrt",
        }
    }
}

/// Elementwise binary ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl ElementwiseBinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementwiseBinaryOp::Add => "add",
            ElementwiseBinaryOp::Sub => "sub",
            ElementwiseBinaryOp::Mul => "mul",
            ElementwiseBinaryOp::Div => "div",
            ElementwiseBinaryOp::Maximum => "max",
            ElementwiseBinaryOp::Minimum => "min",
        }
    }
}

/// Unique identifier for a computation inside a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationId(pub u32);

/// Attribute payload for `parameter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub number: usize,
}

/// Attribute payload for `get_tuple_element`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTupleElementSpec {
    pub index: usize,
}

/// Code generation strategy recorded on a fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusionKind {
    Loop,
    Input,
    Output,
    Custom,
}

impl FusionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FusionKind::Loop => "loop",
            FusionKind::Input => "input",
            FusionKind::Output => "output",
            FusionKind::Custom => "custom",
        }
    }
}

/// Attribute payload for `fusion`: a kernel whose body lives in `calls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionSpec {
    pub kind: FusionKind,
    pub calls: ComputationId,
}

/// Custom-call attributes are limited to simple primitives so they are easy to print and parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum CustomCallAttr {
    I64(i64),
    Bool(bool),
    String(String),
}

impl fmt::Display for CustomCallAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomCallAttr::I64(value) => write!(f, "{value}"),
            CustomCallAttr::Bool(value) => write!(f, "{value}"),
            CustomCallAttr::String(value) => f.write_str(value),
        }
    }
}

/// Attribute payload for `custom_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCallSpec {
    pub target: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, CustomCallAttr>,
}

/// Cross-device collective families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectiveKind {
    AllReduce,
    AllGather,
    ReduceScatter,
    AllToAll,
    CollectivePermute,
}

impl CollectiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectiveKind::AllReduce => "all_reduce",
            CollectiveKind::AllGather => "all_gather",
            CollectiveKind::ReduceScatter => "reduce_scatter",
            CollectiveKind::AllToAll => "all_to_all",
            CollectiveKind::CollectivePermute => "collective_permute",
        }
    }
}

/// Attribute payload for collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveSpec {
    pub kind: CollectiveKind,
}

/// Attribute payload for `conditional`; the first operand selects the branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalSpec {
    pub branches: Vec<ComputationId>,
}

/// Attribute payload for `while`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhileSpec {
    pub condition: ComputationId,
    pub body: ComputationId,
}

/// Distinguishes plain calls from calls that launch an outlined command buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    #[default]
    Regular,
    CommandBuffer,
}

/// Attribute payload for `call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSpec {
    pub to_apply: ComputationId,
    #[serde(default)]
    pub kind: CallKind,
}

/// Unique identifier for SSA values inside one computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Typing information for SSA values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Tuple(Vec<ValueType>),
}

/// Operand reference in an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    TupleElement { tuple: ValueId, index: usize },
}

impl Operand {
    /// Returns the value this operand reads from.
    pub fn value(&self) -> ValueId {
        match self {
            Operand::Value(value) => *value,
            Operand::TupleElement { tuple, .. } => *tuple,
        }
    }

    /// Returns the same operand reading from `value` instead.
    pub fn with_value(self, value: ValueId) -> Operand {
        match self {
            Operand::Value(_) => Operand::Value(value),
            Operand::TupleElement { index, .. } => Operand::TupleElement {
                tuple: value,
                index,
            },
        }
    }
}

/// Declarative form of IR operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Parameter(ParameterSpec),
    Constant(TensorLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    Tuple,
    GetTupleElement(GetTupleElementSpec),
    Bitcast,
    Fusion(FusionSpec),
    CustomCall(CustomCallSpec),
    Collective(CollectiveSpec),
    Conditional(ConditionalSpec),
    While(WhileSpec),
    Call(CallSpec),
}

impl Operation {
    /// Mnemonic used by the text format.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Operation::Parameter(_) => "parameter",
            Operation::Constant(_) => "constant",
            Operation::ElementwiseUnary(op) => op.as_str(),
            Operation::ElementwiseBinary(op) => op.as_str(),
            Operation::Tuple => "tuple",
            Operation::GetTupleElement(_) => "get_tuple_element",
            Operation::Bitcast => "bitcast",
            Operation::Fusion(_) => "fusion",
            Operation::CustomCall(_) => "custom_call",
            Operation::Collective(spec) => spec.kind.as_str(),
            Operation::Conditional(_) => "conditional",
            Operation::While(_) => "while",
            Operation::Call(_) => "call",
        }
    }

    /// Returns `true` for parameters and constants, which read no other value.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Operation::Parameter(_) | Operation::Constant(_))
    }

    /// Lists computations invoked by this operation, in attribute order.
    pub fn called_computations(&self) -> Vec<ComputationId> {
        match self {
            Operation::Fusion(spec) => vec![spec.calls],
            Operation::Conditional(spec) => spec.branches.clone(),
            Operation::While(spec) => vec![spec.condition, spec.body],
            Operation::Call(spec) => vec![spec.to_apply],
            _ => Vec::new(),
        }
    }
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: ValueType,
}

/// A function-like unit of the IR: the body order is its schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    pub id: ComputationId,
    pub name: String,
    #[serde(default = "default_execution_thread")]
    pub execution_thread: String,
    pub body: Vec<Instruction>,
    pub root: ValueId,
}

impl Computation {
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn instruction(&self, value: ValueId) -> Option<&Instruction> {
        self.body.iter().find(|inst| inst.id == value)
    }

    pub fn root_instruction(&self) -> Option<&Instruction> {
        self.instruction(self.root)
    }

    /// Returns the type produced by the root instruction.
    pub fn result_type(&self) -> Option<&ValueType> {
        self.root_instruction().map(|inst| &inst.output)
    }

    /// Parameter instructions ordered by parameter number.
    pub fn parameters(&self) -> Vec<&Instruction> {
        let mut params = self
            .body
            .iter()
            .filter_map(|inst| match inst.op {
                Operation::Parameter(spec) => Some((spec.number, inst)),
                _ => None,
            })
            .collect::<Vec<_>>();
        params.sort_by_key(|(number, _)| *number);
        params.into_iter().map(|(_, inst)| inst).collect()
    }

    /// Returns a value id that is not used by any instruction.
    pub fn next_value_id(&self) -> ValueId {
        let max = self.body.iter().map(|inst| inst.id.0).max();
        ValueId(max.map_or(0, |id| id.wrapping_add(1)))
    }
}

/// Top-level owner of all computations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub entry: ComputationId,
    pub computations: Vec<Computation>,
}

#[derive(Debug, Error)]
pub enum ModuleSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: ComputationId(0),
            computations: Vec::new(),
        }
    }

    /// Takes ownership of `computation`, assigning it a fresh id.
    pub fn add_computation(&mut self, mut computation: Computation) -> ComputationId {
        let id = self.next_computation_id();
        computation.id = id;
        self.computations.push(computation);
        id
    }

    pub fn next_computation_id(&self) -> ComputationId {
        let max = self.computations.iter().map(|comp| comp.id.0).max();
        ComputationId(max.map_or(0, |id| id.wrapping_add(1)))
    }

    pub fn computation(&self, id: ComputationId) -> Option<&Computation> {
        self.computations.iter().find(|comp| comp.id == id)
    }

    pub fn computation_mut(&mut self, id: ComputationId) -> Option<&mut Computation> {
        self.computations.iter_mut().find(|comp| comp.id == id)
    }

    pub fn computation_by_name(&self, name: &str) -> Option<&Computation> {
        self.computations.iter().find(|comp| comp.name == name)
    }

    pub fn entry_computation(&self) -> Option<&Computation> {
        self.computation(self.entry)
    }

    /// Returns `prefix` or the first free `prefix.N` name.
    pub fn next_computation_name(&self, prefix: &str) -> String {
        if self.computation_by_name(prefix).is_none() {
            return prefix.to_string();
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{prefix}.{suffix}");
            if self.computation_by_name(&candidate).is_none() {
                return candidate;
            }
            suffix += 1;
        }
    }

    /// Total number of instructions across all computations.
    pub fn instruction_count(&self) -> usize {
        self.computations.iter().map(Computation::len).sum()
    }

    pub fn to_json_string(&self) -> Result<String, ModuleSerdeError> {
        serde_json::to_string_pretty(self).map_err(ModuleSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ModuleSerdeError> {
        serde_json::from_str(src).map_err(ModuleSerdeError::from)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }

    /// Prints the module with values renumbered by schedule position.
    ///
    /// Two modules with the same structure print identically regardless of the value ids
    /// the pass allocated.
    pub fn to_canonical_text(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = fmt::write(&mut out, format_args!("{}", ModuleText::canonical(self)));
        out
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ModuleText::raw(self).fmt(f)
    }
}

struct ModuleText<'a> {
    module: &'a Module,
    positional: bool,
}

impl<'a> ModuleText<'a> {
    fn raw(module: &'a Module) -> Self {
        Self {
            module,
            positional: false,
        }
    }

    fn canonical(module: &'a Module) -> Self {
        Self {
            module,
            positional: true,
        }
    }
}

impl fmt::Display for ModuleText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, &format!("module @{}", self.module.name))?;
        for computation in &self.module.computations {
            let names = if self.positional {
                computation
                    .body
                    .iter()
                    .enumerate()
                    .map(|(pos, inst)| (inst.id, format!("%{pos}")))
                    .collect::<HashMap<_, _>>()
            } else {
                computation
                    .body
                    .iter()
                    .map(|inst| (inst.id, format!("%{}", inst.id.0)))
                    .collect::<HashMap<_, _>>()
            };
            fmt_computation(self.module, computation, &names, f)?;
        }
        Ok(())
    }
}

fn fmt_computation(
    module: &Module,
    computation: &Computation,
    names: &HashMap<ValueId, String>,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let mut header = String::new();
    if computation.id == module.entry {
        header.push_str("entry ");
    }
    let result_ty = computation
        .result_type()
        .map(format_value_type)
        .unwrap_or_else(|| "()".to_string());
    header.push_str(&format!("func @{}() -> {}", computation.name, result_ty));
    if computation.execution_thread != DEFAULT_EXECUTION_THREAD {
        header.push_str(&format!(" thread[{}]", computation.execution_thread));
    }
    header.push_str(" {");
    write_line(f, 0, &header)?;
    for instruction in &computation.body {
        fmt_instruction(module, instruction, names, 1, f)?;
    }
    write_line(
        f,
        1,
        &format!("return {}", value_name(names, computation.root)),
    )?;
    write_line(f, 0, "}")
}

fn fmt_instruction(
    module: &Module,
    instruction: &Instruction,
    names: &HashMap<ValueId, String>,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let mut line = format!(
        "{} = {}",
        value_name(names, instruction.id),
        instruction.op.mnemonic()
    );
    if !instruction.operands.is_empty() {
        let operands = instruction
            .operands
            .iter()
            .map(|operand| format_operand(names, operand))
            .collect::<Vec<_>>()
            .join(", ");
        line.push_str(&format!("({operands})"));
    }
    for attr in format_attributes(module, &instruction.op) {
        line.push(' ');
        line.push_str(&attr);
    }
    line.push_str(&format!(" -> {}", format_value_type(&instruction.output)));
    write_line(f, indent, &line)
}

fn format_attributes(module: &Module, op: &Operation) -> Vec<String> {
    let callee = |id: ComputationId| match module.computation(id) {
        Some(comp) => format!("@{}", comp.name),
        None => format!("@<missing {}>", id.0),
    };
    match op {
        Operation::Parameter(spec) => vec![format!("number[{}]", spec.number)],
        Operation::Constant(literal) => match literal.f32_splat() {
            Some(value) => vec![format!("splat[{value:?}]")],
            None => {
                let hex = literal
                    .bytes
                    .iter()
                    .map(|byte| format!("{byte:02x}"))
                    .collect::<String>();
                vec![format!("bytes[{hex}]")]
            }
        },
        Operation::GetTupleElement(spec) => vec![format!("index[{}]", spec.index)],
        Operation::Fusion(spec) => vec![
            format!("kind[{}]", spec.kind.as_str()),
            format!("calls[{}]", callee(spec.calls)),
        ],
        Operation::CustomCall(spec) => {
            let mut attrs = vec![format!("target[{}]", spec.target)];
            for (key, value) in &spec.attrs {
                attrs.push(format!("{key}[{value}]"));
            }
            attrs
        }
        Operation::Conditional(spec) => {
            let branches = spec
                .branches
                .iter()
                .map(|id| callee(*id))
                .collect::<Vec<_>>()
                .join(", ");
            vec![format!("branches[{branches}]")]
        }
        Operation::While(spec) => vec![
            format!("condition[{}]", callee(spec.condition)),
            format!("body[{}]", callee(spec.body)),
        ],
        Operation::Call(spec) => {
            let mut attrs = vec![format!("to_apply[{}]", callee(spec.to_apply))];
            if spec.kind == CallKind::CommandBuffer {
                attrs.push("kind[command_buffer]".to_string());
            }
            attrs
        }
        Operation::ElementwiseUnary(_)
        | Operation::ElementwiseBinary(_)
        | Operation::Tuple
        | Operation::Bitcast
        | Operation::Collective(_) => Vec::new(),
    }
}

fn value_name(names: &HashMap<ValueId, String>, value: ValueId) -> String {
    names
        .get(&value)
        .cloned()
        .unwrap_or_else(|| format!("%<undef {}>", value.0))
}

fn format_operand(names: &HashMap<ValueId, String>, operand: &Operand) -> String {
    match operand {
        Operand::Value(id) => value_name(names, *id),
        Operand::TupleElement { tuple, index } => {
            format!("{}[{}]", value_name(names, *tuple), index)
        }
    }
}

/// Renders a value type in the text syntax accepted by the parser.
pub fn format_value_type(value_type: &ValueType) -> String {
    match value_type {
        ValueType::Tensor(spec) => {
            let dims = format_shape(&spec.shape);
            if dims.is_empty() {
                format!("tensor<{}>", spec.dtype.as_str())
            } else {
                format!("tensor<{}, {}>", spec.dtype.as_str(), dims)
            }
        }
        ValueType::Tuple(elements) => {
            let inner = elements
                .iter()
                .map(format_value_type)
                .collect::<Vec<_>>()
                .join(", ");
            format!("({inner})")
        }
    }
}

fn format_shape(shape: &Shape) -> String {
    shape
        .dims()
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join("x")
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Lightweight builder for constructing computations programmatically.
#[derive(Debug, Default)]
pub struct ComputationBuilder {
    next_value_id: u32,
    next_parameter: usize,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, ValueType>,
}

impl ComputationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter with the next free parameter number.
    pub fn add_parameter(&mut self, ty: ValueType) -> ValueId {
        let number = self.next_parameter;
        self.next_parameter += 1;
        self.emit(Operation::Parameter(ParameterSpec { number }), Vec::new(), ty)
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<Operand>, output: ValueType) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.value_types.get(&id)
    }

    /// Finishes the computation. The id is assigned when the module takes ownership.
    pub fn finish(self, name: impl Into<String>, root: ValueId) -> Computation {
        Computation {
            id: ComputationId(u32::MAX),
            name: name.into(),
            execution_thread: default_execution_thread(),
            body: self.instructions,
            root,
        }
    }
}
