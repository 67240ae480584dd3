//! Per-call binding of live buffers to a compiled kernel.

use crate::backend::spec::Device;
use crate::ops::error::{BuildStage, OperatorError, OperatorResult};

/// Buffers bound for one execution call. Built fresh per call and dropped afterwards.
#[derive(Debug)]
pub struct ExecutionBinding<'a, H> {
    inputs: Vec<&'a H>,
    outputs: Vec<&'a H>,
}

impl<'a, H> ExecutionBinding<'a, H> {
    /// Validates the caller's buffers against the build-time descriptor counts.
    ///
    /// All `inputs` are forwarded in caller order (the graph binds them by ordinal); only the
    /// first `kernel_outputs` outputs are forwarded, the rest are descriptor-only.
    pub fn gather(
        expected_inputs: usize,
        expected_outputs: usize,
        kernel_outputs: usize,
        inputs: &[&'a H],
        outputs: &[&'a H],
    ) -> OperatorResult<Self> {
        if inputs.len() != expected_inputs {
            return Err(OperatorError::invalid_argument(
                BuildStage::Execute,
                format!(
                    "expected {expected_inputs} input buffers, got {}",
                    inputs.len()
                ),
            ));
        }
        if outputs.len() != expected_outputs {
            return Err(OperatorError::invalid_argument(
                BuildStage::Execute,
                format!(
                    "expected {expected_outputs} output buffers, got {}",
                    outputs.len()
                ),
            ));
        }
        let bound_outputs = kernel_outputs.min(outputs.len());
        Ok(Self {
            inputs: inputs.to_vec(),
            outputs: outputs[..bound_outputs].to_vec(),
        })
    }

    pub fn inputs(&self) -> &[&'a H] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[&'a H] {
        &self.outputs
    }
}

/// Submits `kernel` once. Failures are surfaced as-is; nothing is retried.
pub fn dispatch<D: Device>(
    device: &D,
    kernel: &D::Kernel,
    persistent: Option<&D::PersistentResource>,
    binding: &ExecutionBinding<'_, D::TensorHandle>,
) -> OperatorResult<()> {
    tracing::trace!(
        backend = device.backend_name(),
        inputs = binding.inputs().len(),
        outputs = binding.outputs().len(),
        persistent = persistent.is_some(),
        "dispatching compiled kernel"
    );
    device
        .execute(kernel, persistent, binding.inputs(), binding.outputs())
        .map_err(|source| OperatorError::Execution {
            backend: device.backend_name().to_string(),
            source,
        })
}
