//! Batch-normalization operator: attribute resolution, support predicate and the
//! build/execute state machine.
//!
//! An operator is constructed once from a [`KernelCreationContext`], built once against a
//! [`Device`], and then executed any number of times with fresh buffers:
//!
//! ```text
//! Unbuilt --build--> Ready --compute--> Ready
//!    \
//!     `--build error--> Failed (permanent)
//! ```

use std::fmt;
use std::sync::Arc;

use crate::backend::spec::{Device, ExecutionFlags, Graph};
use crate::ops::attributes::{names, AttributeMap};
use crate::ops::context::{KernelCreationContext, SupportQueryContext};
use crate::ops::dispatch::{dispatch, ExecutionBinding};
use crate::ops::error::{OperatorError, OperatorResult};
use crate::ops::fusion::{resolve_fused_activation, FusedActivation};
use crate::ops::graph::{build_batch_norm_graph, BuiltGraph};
use crate::ops::slots::INPUT_COUNT;
use crate::ops::tensor_desc::{normalize_tensors, NormalizedTensors};

pub const DEFAULT_EPSILON: f32 = 0.0;
pub const DEFAULT_SPATIAL: i64 = 1;
pub const DEFAULT_TRAINING_MODE: i64 = 0;

/// Scalar attributes consumed by the normalization node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormalizationParams {
    pub epsilon: f32,
    /// When set, mean and variance apply per channel across every spatial axis jointly.
    pub spatial: bool,
}

impl Default for BatchNormalizationParams {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            spatial: DEFAULT_SPATIAL != 0,
        }
    }
}

impl BatchNormalizationParams {
    pub fn from_attributes(attributes: &AttributeMap) -> OperatorResult<Self> {
        let epsilon = attributes.get_or(names::EPSILON, DEFAULT_EPSILON)?;
        let spatial = attributes.get_or(names::SPATIAL, DEFAULT_SPATIAL)?;
        Ok(Self {
            epsilon,
            spatial: spatial != 0,
        })
    }
}

/// Support predicate consulted before construction.
///
/// Only inference is supported: `training_mode` must be absent or `0`. A malformed attribute
/// counts as unsupported.
pub fn query_batch_normalization(ctx: &SupportQueryContext<'_>) -> bool {
    match ctx
        .attributes
        .get_or(names::TRAINING_MODE, DEFAULT_TRAINING_MODE)
    {
        Ok(DEFAULT_TRAINING_MODE) => true,
        Ok(mode) => {
            tracing::debug!(op_type = ctx.op_type, mode, "training mode is not supported");
            false
        }
        Err(err) => {
            tracing::debug!(op_type = ctx.op_type, error = %err, "unreadable training mode");
            false
        }
    }
}

/// Externally observable lifecycle state of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorStatus {
    Unbuilt,
    Ready,
    Failed,
}

enum OperatorState<K, P> {
    Unbuilt,
    Ready { kernel: K, persistent: Option<P> },
    Failed { reason: String },
}

impl<K, P> OperatorState<K, P> {
    fn status(&self) -> OperatorStatus {
        match self {
            OperatorState::Unbuilt => OperatorStatus::Unbuilt,
            OperatorState::Ready { .. } => OperatorStatus::Ready,
            OperatorState::Failed { .. } => OperatorStatus::Failed,
        }
    }
}

/// One batch-normalization node bound to a device.
pub struct BatchNormalizationOperator<D: Device> {
    device: Arc<D>,
    op_type: String,
    tensors: NormalizedTensors,
    params: BatchNormalizationParams,
    fused: FusedActivation,
    flags: ExecutionFlags,
    built: Option<BuiltGraph>,
    state: OperatorState<D::Kernel, D::PersistentResource>,
}

impl<D: Device> BatchNormalizationOperator<D> {
    /// Validates `ctx` and resolves everything that does not need the device.
    ///
    /// The returned operator is [`OperatorStatus::Unbuilt`].
    pub fn new(
        device: Arc<D>,
        ctx: &KernelCreationContext,
        flags: ExecutionFlags,
    ) -> OperatorResult<Self> {
        if !query_batch_normalization(&ctx.support_query()) {
            return Err(OperatorError::unsupported(
                ctx.op_type.clone(),
                "training mode must be 0 or absent",
            ));
        }
        let tensors = normalize_tensors(ctx)?;
        let params = BatchNormalizationParams::from_attributes(&ctx.attributes)?;
        let fused = resolve_fused_activation(&ctx.attributes)?;
        Ok(Self {
            device,
            op_type: ctx.op_type.clone(),
            tensors,
            params,
            fused,
            flags,
            built: None,
            state: OperatorState::Unbuilt,
        })
    }

    /// Constructs and builds in one step.
    pub fn create(
        device: Arc<D>,
        ctx: &KernelCreationContext,
        flags: ExecutionFlags,
    ) -> OperatorResult<Self> {
        let mut operator = Self::new(device, ctx, flags)?;
        operator.build()?;
        Ok(operator)
    }

    /// Builds the graph, compiles it and creates the kernel's persistent resource.
    ///
    /// A no-op once ready. Any error moves the operator to [`OperatorStatus::Failed`] for good;
    /// later calls report [`OperatorError::Failed`].
    #[tracing::instrument(
        name = "batch_norm_build",
        skip(self),
        fields(op_type = %self.op_type, backend = self.device.backend_name())
    )]
    pub fn build(&mut self) -> OperatorResult<()> {
        match &self.state {
            OperatorState::Ready { .. } => return Ok(()),
            OperatorState::Failed { reason } => {
                return Err(OperatorError::Failed {
                    reason: reason.clone(),
                })
            }
            OperatorState::Unbuilt => {}
        }

        match self.try_build() {
            Ok((built, kernel, persistent)) => {
                tracing::info!(
                    nodes = built.graph.nodes.len(),
                    casts = built.cast_count,
                    fused = self.fused.is_fused(),
                    persistent = persistent.is_some(),
                    "compiled batch normalization kernel"
                );
                self.built = Some(built);
                self.state = OperatorState::Ready { kernel, persistent };
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "batch normalization build failed");
                self.state = OperatorState::Failed {
                    reason: err.to_string(),
                };
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn try_build(
        &self,
    ) -> OperatorResult<(BuiltGraph, D::Kernel, Option<D::PersistentResource>)> {
        let built = build_batch_norm_graph(&self.tensors, &self.params, &self.fused)?;
        let compile_error = |source| OperatorError::Compilation {
            backend: self.device.backend_name().to_string(),
            source,
        };
        let kernel = self
            .device
            .compile(&built.graph, self.flags)
            .map_err(compile_error)?;
        let persistent = self
            .device
            .create_persistent_resource(&kernel)
            .map_err(compile_error)?;
        Ok((built, kernel, persistent))
    }

    /// Executes the compiled kernel against caller-owned buffers.
    ///
    /// `inputs` are in interchange order (input, scale, bias, mean, variance); `outputs` must
    /// match the output descriptors given at construction. Output 0 is written in place.
    pub fn compute(
        &self,
        inputs: &[&D::TensorHandle],
        outputs: &[&D::TensorHandle],
    ) -> OperatorResult<()> {
        let (kernel, persistent) = match &self.state {
            OperatorState::Unbuilt => return Err(OperatorError::NotBuilt),
            OperatorState::Failed { reason } => {
                return Err(OperatorError::Failed {
                    reason: reason.clone(),
                })
            }
            OperatorState::Ready { kernel, persistent } => (kernel, persistent.as_ref()),
        };
        let kernel_outputs = self
            .built
            .as_ref()
            .map_or(0, |built| built.graph.outputs.len());
        let binding = ExecutionBinding::gather(
            INPUT_COUNT,
            self.tensors.outputs().len(),
            kernel_outputs,
            inputs,
            outputs,
        )?;
        dispatch(self.device.as_ref(), kernel, persistent, &binding)
    }

    pub fn status(&self) -> OperatorStatus {
        self.state.status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == OperatorStatus::Ready
    }

    /// Failure message recorded when the build failed.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.state {
            OperatorState::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn tensors(&self) -> &NormalizedTensors {
        &self.tensors
    }

    pub fn params(&self) -> BatchNormalizationParams {
        self.params
    }

    pub fn fused_activation(&self) -> &FusedActivation {
        &self.fused
    }

    pub fn flags(&self) -> ExecutionFlags {
        self.flags
    }

    /// Graph handed to the device, once built.
    pub fn graph(&self) -> Option<&Graph> {
        self.built.as_ref().map(|built| &built.graph)
    }

    /// Number of casts the coercion stage inserted, once built.
    pub fn cast_count(&self) -> Option<usize> {
        self.built.as_ref().map(|built| built.cast_count)
    }

    pub fn has_persistent_resource(&self) -> bool {
        matches!(
            &self.state,
            OperatorState::Ready {
                persistent: Some(_),
                ..
            }
        )
    }
}

impl<D: Device> fmt::Debug for BatchNormalizationOperator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchNormalizationOperator")
            .field("backend", &self.device.backend_name())
            .field("op_type", &self.op_type)
            .field("status", &self.status())
            .field("params", &self.params)
            .field("fused", &self.fused)
            .field("flags", &self.flags)
            .finish()
    }
}
