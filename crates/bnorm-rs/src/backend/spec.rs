use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frozen graph format version enforced when graphs are serialized.
pub const GRAPH_FORMAT_VERSION: &str = "bnorm.graph.v1";

fn default_format_version() -> String {
    GRAPH_FORMAT_VERSION.to_string()
}

/// Enumerates scalar element types understood by the device contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Si8,
    Ui8,
    Si32,
    Si64,
    F16,
    Bf16,
    F32,
    F64,
}

impl DType {
    /// Returns `true` when the dtype is a signed or unsigned integer.
    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si8 | DType::Ui8 | DType::Si32 | DType::Si64)
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32 | DType::F64)
    }

    /// Returns the storage size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Si8 | DType::Ui8 => 1,
            DType::F16 | DType::Bf16 => 2,
            DType::Si32 | DType::F32 => 4,
            DType::Si64 | DType::F64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Si8 => "si8",
            DType::Ui8 => "ui8",
            DType::Si32 => "si32",
            DType::Si64 => "si64",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tensor metadata coupling dtype and a fully static shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub dims: Vec<usize>,
}

impl TensorSpec {
    pub fn new(dtype: DType, dims: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            dims: dims.into(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns the element count, or `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(*dim)?;
        }
        Some(count)
    }

    /// Returns total byte length, or `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }
}

/// Dense host payload used to upload or read back device buffers.
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

/// Initialization payload when materialising tensors on a device.
#[derive(Debug, Clone)]
pub enum TensorInit {
    Literal(TensorLiteral),
    Zeroed(TensorSpec),
}

/// Activation functions a device can apply as an inline epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationKind {
    Relu,
    LeakyRelu,
    Elu,
    Selu,
    Celu,
    Sigmoid,
    HardSigmoid,
    Tanh,
    ScaledTanh,
    Softplus,
    Softsign,
    ThresholdedRelu,
}

impl ActivationKind {
    pub const ALL: [ActivationKind; 12] = [
        ActivationKind::Relu,
        ActivationKind::LeakyRelu,
        ActivationKind::Elu,
        ActivationKind::Selu,
        ActivationKind::Celu,
        ActivationKind::Sigmoid,
        ActivationKind::HardSigmoid,
        ActivationKind::Tanh,
        ActivationKind::ScaledTanh,
        ActivationKind::Softplus,
        ActivationKind::Softsign,
        ActivationKind::ThresholdedRelu,
    ];

    /// Operator name used by the interchange format.
    pub fn op_name(self) -> &'static str {
        match self {
            ActivationKind::Relu => "Relu",
            ActivationKind::LeakyRelu => "LeakyRelu",
            ActivationKind::Elu => "Elu",
            ActivationKind::Selu => "Selu",
            ActivationKind::Celu => "Celu",
            ActivationKind::Sigmoid => "Sigmoid",
            ActivationKind::HardSigmoid => "HardSigmoid",
            ActivationKind::Tanh => "Tanh",
            ActivationKind::ScaledTanh => "ScaledTanh",
            ActivationKind::Softplus => "Softplus",
            ActivationKind::Softsign => "Softsign",
            ActivationKind::ThresholdedRelu => "ThresholdedRelu",
        }
    }

    pub fn from_op_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.op_name() == name)
    }

    /// Default `(alpha, beta, gamma)`; `None` marks a parameter the kind does not take.
    pub fn default_params(self) -> (Option<f32>, Option<f32>, Option<f32>) {
        match self {
            ActivationKind::LeakyRelu => (Some(0.01), None, None),
            ActivationKind::Elu | ActivationKind::Celu | ActivationKind::ThresholdedRelu => {
                (Some(1.0), None, None)
            }
            ActivationKind::Selu => (Some(1.673_263_2), None, Some(1.050_701)),
            ActivationKind::HardSigmoid => (Some(0.2), Some(0.5), None),
            ActivationKind::ScaledTanh => (Some(1.0), Some(1.0), None),
            ActivationKind::Relu
            | ActivationKind::Sigmoid
            | ActivationKind::Tanh
            | ActivationKind::Softplus
            | ActivationKind::Softsign => (None, None, None),
        }
    }
}

/// Device-level descriptor of a fused activation epilogue.
///
/// Parameters compare and hash by bit pattern, so `-0.0 != 0.0` and a NaN equals itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActivationDesc {
    pub kind: ActivationKind,
    pub alpha: Option<f32>,
    pub beta: Option<f32>,
    pub gamma: Option<f32>,
}

impl ActivationDesc {
    /// Builds a descriptor carrying the kind's default parameters.
    pub fn new(kind: ActivationKind) -> Self {
        let (alpha, beta, gamma) = kind.default_params();
        Self {
            kind,
            alpha,
            beta,
            gamma,
        }
    }
}

fn param_bits(param: Option<f32>) -> Option<u32> {
    param.map(f32::to_bits)
}

impl PartialEq for ActivationDesc {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && param_bits(self.alpha) == param_bits(other.alpha)
            && param_bits(self.beta) == param_bits(other.beta)
            && param_bits(self.gamma) == param_bits(other.gamma)
    }
}

impl Eq for ActivationDesc {}

impl Hash for ActivationDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        param_bits(self.alpha).hash(state);
        param_bits(self.beta).hash(state);
        param_bits(self.gamma).hash(state);
    }
}

/// Attribute payload for `cast`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

/// Attribute payload for `batch_normalization`.
///
/// Operands are ordered `input, mean, variance, scale, bias`, every one of them already
/// broadcast-aligned to the input rank. `epsilon` compares by bit pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchNormSpec {
    pub epsilon: f32,
    pub spatial: bool,
    pub fused_activation: Option<ActivationDesc>,
}

impl PartialEq for BatchNormSpec {
    fn eq(&self, other: &Self) -> bool {
        self.epsilon.to_bits() == other.epsilon.to_bits()
            && self.spatial == other.spatial
            && self.fused_activation == other.fused_activation
    }
}

impl Eq for BatchNormSpec {}

impl Hash for BatchNormSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.epsilon.to_bits().hash(state);
        self.spatial.hash(state);
        self.fused_activation.hash(state);
    }
}

/// Unique identifier for SSA values in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Operations a compiled graph may contain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Cast(CastSpec),
    BatchNormalization(BatchNormSpec),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Cast(_) => "cast",
            Operation::BatchNormalization(_) => "batch_normalization",
        }
    }
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub output: TensorSpec,
}

/// Named graph input bound to the ordinal position of the caller's input array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphInput {
    pub name: String,
    pub ordinal: usize,
    pub id: ValueId,
    pub spec: TensorSpec,
}

/// Graph result bound to the ordinal position of the caller's output array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphOutput {
    pub ordinal: usize,
    pub id: ValueId,
    pub spec: TensorSpec,
}

/// Dataflow graph handed to a device for compilation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default = "default_format_version")]
    pub format_version: String,
    pub name: String,
    pub inputs: Vec<GraphInput>,
    pub nodes: Vec<Instruction>,
    pub outputs: Vec<GraphOutput>,
}

#[derive(Debug, Error)]
pub enum GraphSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("graph format version '{found}' does not match expected '{expected}'")]
    FormatVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Graph {
    /// Returns the input bound to `ordinal`, if any.
    pub fn input_by_ordinal(&self, ordinal: usize) -> Option<&GraphInput> {
        self.inputs.iter().find(|input| input.ordinal == ordinal)
    }

    pub fn input_by_name(&self, name: &str) -> Option<&GraphInput> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// Resolves the tensor spec of a graph input or node result.
    pub fn value_spec(&self, id: ValueId) -> Option<&TensorSpec> {
        self.inputs
            .iter()
            .find(|input| input.id == id)
            .map(|input| &input.spec)
            .or_else(|| {
                self.nodes
                    .iter()
                    .find(|node| node.id == id)
                    .map(|node| &node.output)
            })
    }

    /// Counts nodes whose operation matches `predicate`.
    pub fn count_nodes(&self, predicate: impl Fn(&Operation) -> bool) -> usize {
        self.nodes.iter().filter(|node| predicate(&node.op)).count()
    }

    pub fn to_json_string(&self) -> Result<String, GraphSerdeError> {
        serde_json::to_string_pretty(self).map_err(GraphSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, GraphSerdeError> {
        let mut graph: Graph = serde_json::from_str(src)?;
        graph.format_version = normalize_format_version(graph.format_version)?;
        Ok(graph)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_format_version(version: String) -> Result<String, GraphSerdeError> {
    if version.is_empty() {
        return Ok(GRAPH_FORMAT_VERSION.to_string());
    }
    if version == GRAPH_FORMAT_VERSION {
        Ok(version)
    } else {
        Err(GraphSerdeError::FormatVersionMismatch {
            found: version,
            expected: GRAPH_FORMAT_VERSION,
        })
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!("graph @{} (format = {}) {{", self.name, self.format_version),
        )?;
        if !self.inputs.is_empty() {
            write_line(f, 1, "inputs:")?;
            for input in &self.inputs {
                write_line(
                    f,
                    2,
                    &format!(
                        "%{} : {} = arg{} \"{}\"",
                        input.id.0,
                        format_spec(&input.spec),
                        input.ordinal,
                        input.name
                    ),
                )?;
            }
        }
        if !self.nodes.is_empty() {
            write_line(f, 1, "body:")?;
            for node in &self.nodes {
                fmt_instruction(node, 2, f)?;
            }
        }
        if !self.outputs.is_empty() {
            write_line(f, 1, "outputs:")?;
            for output in &self.outputs {
                write_line(
                    f,
                    2,
                    &format!(
                        "out{} = %{} : {}",
                        output.ordinal,
                        output.id.0,
                        format_spec(&output.spec)
                    ),
                )?;
            }
        }
        write_line(f, 0, "}")
    }
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(|id| format!("%{}", id.0))
        .collect::<Vec<_>>()
        .join(", ");
    let attrs = match &instruction.op {
        Operation::Cast(spec) => format!("dtype={}", spec.dtype),
        Operation::BatchNormalization(spec) => {
            let mut attrs = format!("epsilon={:e}, spatial={}", spec.epsilon, spec.spatial);
            if let Some(activation) = &spec.fused_activation {
                attrs.push_str(&format!(", fused={}", activation.kind.op_name()));
            }
            attrs
        }
    };
    write_line(
        f,
        indent,
        &format!(
            "%{} = {}({}) {{{}}} -> {}",
            instruction.id.0,
            instruction.op.name(),
            operands,
            attrs,
            format_spec(&instruction.output)
        ),
    )
}

fn format_spec(spec: &TensorSpec) -> String {
    let dims = if spec.dims.is_empty() {
        "[]".to_string()
    } else {
        spec.dims
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x")
    };
    format!("tensor<{}, {}>", spec.dtype, dims)
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Lightweight builder for constructing graphs programmatically.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    next_value_id: u32,
    inputs: Vec<GraphInput>,
    nodes: Vec<Instruction>,
    value_types: HashMap<ValueId, TensorSpec>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }

    /// Declares a named graph input read from position `ordinal` of the caller's input array.
    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        ordinal: usize,
        spec: TensorSpec,
    ) -> ValueId {
        let id = self.fresh_id();
        self.value_types.insert(id, spec.clone());
        self.inputs.push(GraphInput {
            name: name.into(),
            ordinal,
            id,
            spec,
        });
        id
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<ValueId>, output: TensorSpec) -> ValueId {
        let id = self.fresh_id();
        self.value_types.insert(id, output.clone());
        self.nodes.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn value_spec(&self, id: ValueId) -> Option<&TensorSpec> {
        self.value_types.get(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Seals the graph; result `i` is bound to output ordinal `i`.
    pub fn finish(self, name: impl Into<String>, result_ids: Vec<ValueId>) -> BackendResult<Graph> {
        let mut outputs = Vec::with_capacity(result_ids.len());
        for (ordinal, id) in result_ids.into_iter().enumerate() {
            let spec = self.value_types.get(&id).cloned().ok_or_else(|| {
                BackendError::spec(
                    SpecErrorCode::UnknownValue,
                    format!("graph result %{} has no recorded type", id.0),
                )
            })?;
            outputs.push(GraphOutput { ordinal, id, spec });
        }
        Ok(Graph {
            format_version: GRAPH_FORMAT_VERSION.to_string(),
            name: name.into(),
            inputs: self.inputs,
            nodes: self.nodes,
            outputs,
        })
    }
}

/// Device scheduling preference requested at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPreference {
    #[default]
    FavorPerformance,
    ConserveMemory,
}

/// Caller-supplied options that shape how a device compiles a graph.
///
/// `Default` reads `BNORM_EXECUTION_PREFERENCE` and `BNORM_ALLOW_HALF_PRECISION` once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionFlags {
    #[serde(default)]
    pub preference: ExecutionPreference,
    /// Lets a device keep half-precision intermediates when the input itself is half precision.
    #[serde(default)]
    pub allow_half_precision_computation: bool,
}

impl Default for ExecutionFlags {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ExecutionFlags {
    pub fn from_env() -> Self {
        Self {
            preference: crate::env::execution_preference(),
            allow_half_precision_computation: crate::env::allow_half_precision(),
        }
    }

    pub fn with_preference(mut self, preference: ExecutionPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_half_precision_computation(mut self, allow: bool) -> Self {
        self.allow_half_precision_computation = allow;
        self
    }
}

/// Stable set of contract violation identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpecErrorCode {
    DTypeNotSupported,
    DTypeMismatch,
    InvalidAttributeValue,
    OperandCountMismatch,
    BroadcastRankMismatch,
    BroadcastDimsInvalid,
    UnknownValue,
    Unspecified(&'static str),
}

impl SpecErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecErrorCode::DTypeNotSupported => "SpecError: dtype not supported for op",
            SpecErrorCode::DTypeMismatch => "SpecError: operand dtypes must match",
            SpecErrorCode::InvalidAttributeValue => "SpecError: invalid attribute value",
            SpecErrorCode::OperandCountMismatch => "SpecError: operand count mismatch",
            SpecErrorCode::BroadcastRankMismatch => "SpecError: broadcast rank mismatch",
            SpecErrorCode::BroadcastDimsInvalid => "SpecError: operand is not broadcastable",
            SpecErrorCode::UnknownValue => "SpecError: unknown value id",
            SpecErrorCode::Unspecified(code) => code,
        }
    }
}

/// Validation failure captured before execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecError {
    pub code: SpecErrorCode,
    pub detail: Option<String>,
}

impl SpecError {
    pub fn new(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.code.as_str()),
            None => write!(f, "{}", self.code.as_str()),
        }
    }
}

impl std::error::Error for SpecError {}

/// Device error surfaced to the operator layer.
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

/// Convenience alias for results returned by device routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Device contract: compiles graphs into opaque kernels and executes them against buffers.
pub trait Device: Send + Sync {
    type TensorHandle: Send + Sync + 'static;
    type Kernel: Send + Sync + 'static;
    type PersistentResource: Send + Sync + 'static;

    /// Returns a human-readable device identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Materialises a buffer from host initialisation data.
    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle>;

    /// Reads a buffer back into a dense literal.
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Compiles `graph` into an immutable kernel.
    fn compile(&self, graph: &Graph, flags: ExecutionFlags) -> BackendResult<Self::Kernel>;

    /// Creates the persistent resource a kernel declared, if any.
    ///
    /// Called once per kernel right after compilation; the result lives as long as the kernel.
    fn create_persistent_resource(
        &self,
        _kernel: &Self::Kernel,
    ) -> BackendResult<Option<Self::PersistentResource>> {
        Ok(None)
    }

    /// Runs a compiled kernel.
    ///
    /// `inputs[i]` is the buffer bound to graph input ordinal `i`; `outputs[i]` receives graph
    /// output `i` and is written in place.
    fn execute(
        &self,
        kernel: &Self::Kernel,
        persistent: Option<&Self::PersistentResource>,
        inputs: &[&Self::TensorHandle],
        outputs: &[&Self::TensorHandle],
    ) -> BackendResult<()>;
}
