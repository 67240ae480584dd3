use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bnorm_rs::backend::hashing::kernel_fingerprint;
use bnorm_rs::backend::shape_helpers::broadcast_strides_or_error;
use bnorm_rs::backend::spec::{
    BackendError, BackendResult, BatchNormSpec, DType, Device, ExecutionFlags, Graph, Instruction,
    Operation, SpecErrorCode, TensorInit, TensorLiteral, TensorSpec, ValueId,
};

use crate::kernels::{self, BatchNormOperands};
use crate::tensor::{CpuTensor, TensorData};

const BATCH_NORM_OPERANDS: usize = 5;

/// Validated, immutable execution plan for one graph.
#[derive(Debug)]
pub struct CompiledGraph {
    graph: Graph,
    flags: ExecutionFlags,
    fingerprint: u64,
    steps: Vec<Step>,
}

#[derive(Debug)]
enum Step {
    Cast {
        id: ValueId,
        operand: ValueId,
        output: TensorSpec,
    },
    BatchNorm {
        id: ValueId,
        operands: [ValueId; BATCH_NORM_OPERANDS],
        strides: [Vec<usize>; BATCH_NORM_OPERANDS - 1],
        dims: Vec<usize>,
        spec: BatchNormSpec,
        compute_dtype: DType,
    },
}

impl CompiledGraph {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn flags(&self) -> ExecutionFlags {
        self.flags
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Precision the normalization keeps its intermediates in, if the graph normalizes.
    pub fn compute_dtype(&self) -> Option<DType> {
        self.steps.iter().find_map(|step| match step {
            Step::BatchNorm { compute_dtype, .. } => Some(*compute_dtype),
            Step::Cast { .. } => None,
        })
    }
}

/// Kernel handle; clones share one compiled plan.
#[derive(Debug, Clone)]
pub struct CpuKernel {
    compiled: Arc<CompiledGraph>,
}

impl CpuKernel {
    pub fn compiled(&self) -> &CompiledGraph {
        &self.compiled
    }
}

/// Reference CPU device. Compiled plans are cached by graph fingerprint until
/// [`CpuDevice::clear_kernel_cache`].
#[derive(Debug, Default)]
pub struct CpuDevice {
    cache: Mutex<HashMap<u64, Arc<CompiledGraph>>>,
    compilations: AtomicUsize,
    executions: AtomicUsize,
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of graphs actually compiled (cache hits excluded).
    pub fn compilation_count(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn cached_kernel_count(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every cached plan; kernels already handed out stay valid.
    pub fn clear_kernel_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Device for CpuDevice {
    type TensorHandle = CpuTensor;
    type Kernel = CpuKernel;
    type PersistentResource = ();

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        match init {
            TensorInit::Literal(literal) => CpuTensor::from_literal(&literal),
            TensorInit::Zeroed(spec) => CpuTensor::zeroed(spec),
        }
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        tensor.to_literal()
    }

    fn compile(&self, graph: &Graph, flags: ExecutionFlags) -> BackendResult<Self::Kernel> {
        let fingerprint = kernel_fingerprint(graph, flags);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(compiled) = cache.get(&fingerprint) {
            tracing::trace!(graph = %graph.name, fingerprint, "cpu kernel cache hit");
            return Ok(CpuKernel {
                compiled: Arc::clone(compiled),
            });
        }
        let steps = plan_graph(graph, flags)?;
        let compiled = Arc::new(CompiledGraph {
            graph: graph.clone(),
            flags,
            fingerprint,
            steps,
        });
        cache.insert(fingerprint, Arc::clone(&compiled));
        self.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            graph = %graph.name,
            fingerprint,
            nodes = graph.nodes.len(),
            "compiled cpu kernel"
        );
        Ok(CpuKernel { compiled })
    }

    fn execute(
        &self,
        kernel: &Self::Kernel,
        _persistent: Option<&Self::PersistentResource>,
        inputs: &[&Self::TensorHandle],
        outputs: &[&Self::TensorHandle],
    ) -> BackendResult<()> {
        let compiled = kernel.compiled();
        let graph = compiled.graph();
        if inputs.len() != graph.inputs.len() {
            return Err(BackendError::spec(
                SpecErrorCode::OperandCountMismatch,
                format!(
                    "kernel expects {} inputs, got {}",
                    graph.inputs.len(),
                    inputs.len()
                ),
            ));
        }
        if outputs.len() != graph.outputs.len() {
            return Err(BackendError::spec(
                SpecErrorCode::OperandCountMismatch,
                format!(
                    "kernel expects {} outputs, got {}",
                    graph.outputs.len(),
                    outputs.len()
                ),
            ));
        }

        let mut values: HashMap<ValueId, Vec<f64>> = HashMap::new();
        for input in &graph.inputs {
            let tensor = bound(inputs, input.ordinal, &input.name)?;
            ensure_matches(&tensor.spec, &input.spec, &input.name)?;
            values.insert(input.id, tensor.to_f64_vec());
        }

        for step in &compiled.steps {
            let (id, result) = run_step(step, &values)?;
            values.insert(id, result);
        }

        for output in &graph.outputs {
            let tensor = bound(outputs, output.ordinal, "output")?;
            ensure_matches(&tensor.spec, &output.spec, "output")?;
            let result = values.get(&output.id).ok_or_else(|| {
                BackendError::execution(format!("graph result %{} was not computed", output.id.0))
            })?;
            tensor.store_f64(result)?;
        }
        self.executions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Buffers bind by layout: the dtype and element count must agree, the dims may be the raw
/// (unaligned) shape the caller allocated.
fn ensure_matches(actual: &TensorSpec, expected: &TensorSpec, name: &str) -> BackendResult<()> {
    if actual.dtype != expected.dtype {
        return Err(BackendError::spec(
            SpecErrorCode::DTypeMismatch,
            format!(
                "buffer '{name}' is {} but the kernel expects {}",
                actual.dtype, expected.dtype
            ),
        ));
    }
    if actual.element_count() != expected.element_count() {
        return Err(BackendError::execution(format!(
            "buffer '{name}' has dims {:?} but the kernel expects {:?}",
            actual.dims, expected.dims
        )));
    }
    Ok(())
}

fn bound<'a>(
    buffers: &[&'a CpuTensor],
    ordinal: usize,
    name: &str,
) -> BackendResult<&'a CpuTensor> {
    buffers.get(ordinal).copied().ok_or_else(|| {
        BackendError::execution(format!(
            "no buffer bound to '{name}' at ordinal {ordinal} of {}",
            buffers.len()
        ))
    })
}

fn lookup(values: &HashMap<ValueId, Vec<f64>>, id: ValueId) -> BackendResult<&[f64]> {
    values
        .get(&id)
        .map(Vec::as_slice)
        .ok_or_else(|| BackendError::execution(format!("operand %{} missing", id.0)))
}

fn run_step(step: &Step, values: &HashMap<ValueId, Vec<f64>>) -> BackendResult<(ValueId, Vec<f64>)> {
    match step {
        Step::Cast {
            id,
            operand,
            output,
        } => Ok((*id, kernels::cast(lookup(values, *operand)?, output.dtype)?)),
        Step::BatchNorm {
            id,
            operands,
            strides,
            dims,
            spec,
            compute_dtype,
        } => {
            let [input, mean, variance, scale, bias] = *operands;
            let operands = BatchNormOperands {
                input: lookup(values, input)?,
                mean: (lookup(values, mean)?, &strides[0]),
                variance: (lookup(values, variance)?, &strides[1]),
                scale: (lookup(values, scale)?, &strides[2]),
                bias: (lookup(values, bias)?, &strides[3]),
            };
            Ok((*id, kernels::batch_norm(&operands, dims, spec, *compute_dtype)))
        }
    }
}

fn check_ordinals<'a>(
    kind: &str,
    bindings: impl ExactSizeIterator<Item = (&'a str, usize, &'a TensorSpec)>,
) -> BackendResult<()> {
    let count = bindings.len();
    let mut seen = HashSet::new();
    for (name, ordinal, spec) in bindings {
        if ordinal >= count || !seen.insert(ordinal) {
            return Err(BackendError::spec(
                SpecErrorCode::InvalidAttributeValue,
                format!("graph {kind} '{name}' has invalid or duplicate ordinal {ordinal}"),
            ));
        }
        if !TensorData::supports(spec.dtype) {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!("graph {kind} '{name}' is {}", spec.dtype),
            ));
        }
    }
    Ok(())
}

fn plan_graph(graph: &Graph, flags: ExecutionFlags) -> BackendResult<Vec<Step>> {
    check_ordinals(
        "input",
        graph
            .inputs
            .iter()
            .map(|input| (input.name.as_str(), input.ordinal, &input.spec)),
    )?;
    check_ordinals(
        "output",
        graph
            .outputs
            .iter()
            .map(|output| ("output", output.ordinal, &output.spec)),
    )?;

    let mut defined: HashMap<ValueId, &TensorSpec> = graph
        .inputs
        .iter()
        .map(|input| (input.id, &input.spec))
        .collect();
    let mut steps = Vec::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        let operand_specs = node
            .operands
            .iter()
            .map(|id| {
                defined.get(id).copied().ok_or_else(|| {
                    BackendError::spec(
                        SpecErrorCode::UnknownValue,
                        format!("%{} used before definition", id.0),
                    )
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        steps.push(plan_node(node, &operand_specs, flags)?);
        defined.insert(node.id, &node.output);
    }
    Ok(steps)
}

fn plan_node(
    node: &Instruction,
    operand_specs: &[&TensorSpec],
    flags: ExecutionFlags,
) -> BackendResult<Step> {
    match &node.op {
        Operation::Cast(spec) => {
            let [operand] = operand_specs else {
                return Err(BackendError::spec(
                    SpecErrorCode::OperandCountMismatch,
                    format!("cast expects 1 operand, got {}", operand_specs.len()),
                ));
            };
            if node.output.dtype != spec.dtype || node.output.dims != operand.dims {
                return Err(BackendError::spec(
                    SpecErrorCode::InvalidAttributeValue,
                    "cast output must keep the operand dims and carry the target dtype"
                        .to_string(),
                ));
            }
            if !TensorData::supports(spec.dtype) {
                return Err(BackendError::spec(
                    SpecErrorCode::DTypeNotSupported,
                    format!("cpu casts cannot produce {}", spec.dtype),
                ));
            }
            Ok(Step::Cast {
                id: node.id,
                operand: node.operands[0],
                output: node.output.clone(),
            })
        }
        Operation::BatchNormalization(spec) => plan_batch_norm(node, spec, operand_specs, flags),
    }
}

fn plan_batch_norm(
    node: &Instruction,
    spec: &BatchNormSpec,
    operand_specs: &[&TensorSpec],
    flags: ExecutionFlags,
) -> BackendResult<Step> {
    let [input, auxiliaries @ ..] = operand_specs else {
        return Err(BackendError::spec(SpecErrorCode::OperandCountMismatch, None::<String>));
    };
    if operand_specs.len() != BATCH_NORM_OPERANDS {
        return Err(BackendError::spec(
            SpecErrorCode::OperandCountMismatch,
            format!(
                "batch_normalization expects {BATCH_NORM_OPERANDS} operands, got {}",
                operand_specs.len()
            ),
        ));
    }
    if !input.dtype.is_float() {
        return Err(BackendError::spec(
            SpecErrorCode::DTypeNotSupported,
            format!("batch_normalization requires a float input, got {}", input.dtype),
        ));
    }
    if node.output != **input {
        return Err(BackendError::spec(
            SpecErrorCode::InvalidAttributeValue,
            "batch_normalization output must match the input spec".to_string(),
        ));
    }
    if !spec.epsilon.is_finite() || spec.epsilon < 0.0 {
        return Err(BackendError::spec(
            SpecErrorCode::InvalidAttributeValue,
            format!("epsilon must be finite and non-negative, got {}", spec.epsilon),
        ));
    }

    let compute_dtype = match input.dtype {
        DType::F16 | DType::Bf16 if flags.allow_half_precision_computation => input.dtype,
        _ => DType::F64,
    };

    let mut strides: [Vec<usize>; BATCH_NORM_OPERANDS - 1] = Default::default();
    for (position, aux) in auxiliaries.iter().enumerate() {
        if aux.dtype != input.dtype {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeMismatch,
                format!(
                    "operand {} is {} but the input is {}",
                    position + 1,
                    aux.dtype,
                    input.dtype
                ),
            ));
        }
        if spec.spatial && aux.dims.iter().enumerate().any(|(axis, &dim)| axis != 1 && dim != 1) {
            return Err(BackendError::spec(
                SpecErrorCode::InvalidAttributeValue,
                format!(
                    "spatial batch normalization needs per-channel operands, operand {} has dims {:?}",
                    position + 1,
                    aux.dims
                ),
            ));
        }
        strides[position] = broadcast_strides_or_error(&aux.dims, &input.dims, |axis| match axis {
            None => BackendError::spec(
                SpecErrorCode::BroadcastRankMismatch,
                format!("operand {} rank differs from the input rank", position + 1),
            ),
            Some(axis) => BackendError::spec(
                SpecErrorCode::BroadcastDimsInvalid,
                format!(
                    "operand {} axis {axis} has extent {} against input extent {}",
                    position + 1,
                    aux.dims[axis],
                    input.dims[axis]
                ),
            ),
        })?;
    }

    Ok(Step::BatchNorm {
        id: node.id,
        operands: [
            node.operands[0],
            node.operands[1],
            node.operands[2],
            node.operands[3],
            node.operands[4],
        ],
        strides,
        dims: input.dims.clone(),
        spec: *spec,
        compute_dtype,
    })
}
