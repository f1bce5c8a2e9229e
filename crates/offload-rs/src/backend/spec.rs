use std::{fmt, fs, io, path::Path, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Frozen IR version enforced when loading serialized programs.
pub const SPEC_VERSION: &str = "oir.v1";

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// Scalar element types understood by the host kernels and accelerator backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Si32,
    F32,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Si32 | DType::F32 => 4,
        }
    }

    /// Returns the conventional lowercase name (`int32`, `float32`).
    pub fn name(self) -> &'static str {
        match self {
            DType::Si32 => "int32",
            DType::F32 => "float32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical tensor shape. Every dimension is static.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn into_dims(self) -> Vec<usize> {
        self.dims
    }

    /// Returns the element count, or `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(*dim)?;
        }
        Some(count)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("[]");
        }
        let dims = self
            .dims
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>();
        f.write_str(&dims.join("x"))
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

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{} x {}>", self.dtype, self.shape)
    }
}

/// Dense literal tensor payload stored in native byte order.
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
}

/// Elementwise binary ops. Operands must share one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Maximum,
    Minimum,
}

/// Attribute payload for `nn.bias_add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BiasAddSpec {
    /// Axis of the data tensor the rank-1 bias runs along. Negative values count from the end.
    pub axis: i64,
}

/// Attribute payload for calls into a partitioned external function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalCallSpec {
    /// Name of the accelerator backend that owns the callee.
    pub compiler: String,
    /// Global symbol the compiled region is exported under.
    pub symbol: String,
    /// Name of the callee function inside the program.
    pub function: String,
}

/// Execution target assigned to an instruction by annotation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Target {
    Host,
    External(String),
}

impl Target {
    pub fn is_external(&self) -> bool {
        matches!(self, Target::External(_))
    }

    pub fn backend(&self) -> Option<&str> {
        match self {
            Target::Host => None,
            Target::External(name) => Some(name),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host => f.write_str("host"),
            Target::External(name) => f.write_str(name),
        }
    }
}

/// Unique identifier for SSA values in a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Typing information for SSA values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Tuple(Vec<ValueType>),
}

impl ValueType {
    pub fn as_tensor(&self) -> Option<&TensorSpec> {
        match self {
            ValueType::Tensor(spec) => Some(spec),
            ValueType::Tuple(_) => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(spec) => write!(f, "{spec}"),
            ValueType::Tuple(elements) => {
                let inner = elements
                    .iter()
                    .map(|element| element.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "tuple<{inner}>")
            }
        }
    }
}

/// Operand reference in an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    TupleElement { tuple: ValueId, index: usize },
    Literal(TensorLiteral),
}

impl Operand {
    /// Returns the SSA value this operand reads, if any.
    pub fn value_id(&self) -> Option<ValueId> {
        match self {
            Operand::Value(id) => Some(*id),
            Operand::TupleElement { tuple, .. } => Some(*tuple),
            Operand::Literal(_) => None,
        }
    }
}

/// Declarative form of IR operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    BiasAdd(BiasAddSpec),
    ExternalCall(ExternalCallSpec),
    /// Projects element `index` out of a tuple value.
    TupleGet { index: usize },
}

impl Operation {
    /// Canonical operator name used by support predicates and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg) => "negative",
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Abs) => "abs",
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add) => "add",
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Sub) => "subtract",
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul) => "multiply",
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Maximum) => "maximum",
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Minimum) => "minimum",
            Operation::BiasAdd(_) => "nn.bias_add",
            Operation::ExternalCall(_) => "external_call",
            Operation::TupleGet { .. } => "tuple_get",
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
    /// Placement chosen by annotation; `None` on freshly built or partitioned programs.
    #[serde(default)]
    pub target: Option<Target>,
}

/// IR function describing a reusable computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<ValueType>,
    pub parameter_ids: Vec<ValueId>,
    #[serde(default)]
    pub parameter_names: Vec<String>,
    pub results: Vec<ValueType>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
    /// Set on functions produced by partitioning; names the backend that compiles them.
    #[serde(default)]
    pub compiler: Option<String>,
}

impl Function {
    pub fn is_external(&self) -> bool {
        self.compiler.is_some()
    }

    /// Returns the declared name of parameter `index`, or a positional fallback.
    pub fn parameter_name(&self, index: usize) -> String {
        self.parameter_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("p{index}"))
    }
}

/// Complete IR module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    pub entry: String,
    pub functions: Vec<Function>,
}

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

#[derive(Debug, Error)]
pub enum ProgramIoError {
    #[error(transparent)]
    Serialization(#[from] ProgramSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.function(&self.entry)
    }

    /// Iterates over functions that were split out for an accelerator backend.
    pub fn external_functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter(|function| function.is_external())
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = serde_json::from_str(src).map_err(ProgramSerdeError::from)?;
        program.spec_version = normalize_spec_version(program.spec_version)?;
        Ok(program)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ProgramSerdeError> {
        bincode::serialize(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = bincode::deserialize(bytes).map_err(ProgramSerdeError::from)?;
        program.spec_version = normalize_spec_version(program.spec_version)?;
        Ok(program)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ProgramIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(ProgramIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ProgramIoError> {
        let contents = fs::read_to_string(path).map_err(ProgramIoError::from)?;
        Program::from_json_str(&contents).map_err(ProgramIoError::from)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_spec_version(version: String) -> Result<String, ProgramSerdeError> {
    if version.is_empty() {
        return Ok(SPEC_VERSION.to_string());
    }
    if version == SPEC_VERSION {
        Ok(version)
    } else {
        Err(ProgramSerdeError::SpecVersionMismatch {
            found: version,
            expected: SPEC_VERSION,
        })
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!(
                "program @{} (spec_version = {}) {{",
                self.entry, self.spec_version
            ),
        )?;
        for function in &self.functions {
            fmt_function(function, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_function(function: &Function, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let header = match &function.compiler {
        Some(compiler) => format!("func @{} [compiler = {compiler}] {{", function.name),
        None => format!("func @{} {{", function.name),
    };
    write_line(f, indent, &header)?;
    if !function.parameter_ids.is_empty() {
        write_line(f, indent + 1, "params:")?;
        for (index, (value_id, value_type)) in function
            .parameter_ids
            .iter()
            .zip(function.parameters.iter())
            .enumerate()
        {
            write_line(
                f,
                indent + 2,
                &format!(
                    "%{} \"{}\" : {}",
                    value_id.0,
                    function.parameter_name(index),
                    value_type
                ),
            )?;
        }
    }
    if !function.body.is_empty() {
        write_line(f, indent + 1, "body:")?;
        for instruction in &function.body {
            fmt_instruction(instruction, indent + 2, f)?;
        }
    }
    if !function.result_ids.is_empty() {
        write_line(f, indent + 1, "results:")?;
        for (value_id, value_type) in function.result_ids.iter().zip(function.results.iter()) {
            write_line(f, indent + 2, &format!("%{} : {}", value_id.0, value_type))?;
        }
    }
    write_line(f, indent, "}")
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(format_operand)
        .collect::<Vec<_>>()
        .join(", ");
    let mut line = format!(
        "%{} = {}({}) -> {}",
        instruction.id.0,
        format_operation(&instruction.op),
        operands,
        instruction.output
    );
    if let Some(target) = &instruction.target {
        line.push_str(&format!(" @{target}"));
    }
    write_line(f, indent, &line)
}

fn format_operation(op: &Operation) -> String {
    match op {
        Operation::BiasAdd(spec) => format!("nn.bias_add[axis={}]", spec.axis),
        Operation::ExternalCall(spec) => {
            format!("external_call[{} @{}]", spec.compiler, spec.symbol)
        }
        Operation::Constant(literal) => format!("constant[{}]", literal.spec),
        Operation::TupleGet { index } => format!("tuple_get[{index}]"),
        other => other.name().to_string(),
    }
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::Value(id) => format!("%{}", id.0),
        Operand::TupleElement { tuple, index } => format!("%{}.{}", tuple.0, index),
        Operand::Literal(lit) => format!("literal({})", lit.spec),
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Backend error surfaced to higher layers.
#[derive(Debug)]
pub enum BackendError {
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
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

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_program() -> Program {
        let spec = TensorSpec::new(DType::Si32, Shape::new(vec![2, 2]));
        let function = Function {
            name: "main".to_string(),
            parameters: vec![
                ValueType::Tensor(spec.clone()),
                ValueType::Tensor(spec.clone()),
            ],
            parameter_ids: vec![ValueId(0), ValueId(1)],
            parameter_names: vec!["x".to_string(), "y".to_string()],
            results: vec![ValueType::Tensor(spec.clone())],
            body: vec![Instruction {
                id: ValueId(2),
                op: Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
                operands: vec![Operand::Value(ValueId(0)), Operand::Value(ValueId(1))],
                output: ValueType::Tensor(spec),
                target: Some(Target::External("vsim".to_string())),
            }],
            result_ids: vec![ValueId(2)],
            compiler: None,
        };
        Program::new("main").with_functions(vec![function])
    }

    #[test]
    fn json_round_trip_preserves_targets() {
        let program = sample_program();
        let json = program.to_json_string().expect("serialize");
        let restored = Program::from_json_str(&json).expect("deserialize");
        assert_eq!(restored, program);
    }

    #[test]
    fn bincode_round_trip_keeps_unset_targets() {
        let mut builder = crate::backend::builder::ProgramBuilder::new();
        let spec = TensorSpec::new(DType::F32, Shape::new(vec![3]));
        let x = builder.parameter("x", spec.clone()).expect("x");
        let y = builder.parameter("y", spec).expect("y");
        let z = builder.add(x, y).expect("add");
        let program = builder.finish_program("main", vec![z]).expect("program");
        assert!(program.functions[0].body[0].target.is_none());
        assert!(program.functions[0].compiler.is_none());

        let bytes = program.to_bincode_bytes().expect("serialize");
        let restored = Program::from_bincode_slice(&bytes).expect("deserialize");
        assert_eq!(restored, program);
    }

    #[test]
    fn rejects_foreign_spec_version() {
        let mut program = sample_program();
        program.spec_version = "oir.v0".to_string();
        let bytes = program.to_bincode_bytes().expect("serialize");
        let err = Program::from_bincode_slice(&bytes).expect_err("version mismatch");
        assert!(matches!(err, ProgramSerdeError::SpecVersionMismatch { .. }));
    }

    #[test]
    fn text_form_lists_names_and_targets() {
        let text = sample_program().to_text();
        assert!(text.contains("%0 \"x\" : tensor<int32 x 2x2>"));
        assert!(text.contains("%2 = add(%0, %1) -> tensor<int32 x 2x2> @vsim"));
    }

    #[test]
    fn operation_names_are_canonical() {
        assert_eq!(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add).name(),
            "add"
        );
        assert_eq!(Operation::BiasAdd(BiasAddSpec { axis: 3 }).name(), "nn.bias_add");
    }
}
