//! Resolution of a trailing activation folded into the normalization kernel.

use crate::backend::spec::{ActivationDesc, ActivationKind};
use crate::ops::attributes::{names, AttributeMap};
use crate::ops::error::{BuildStage, OperatorError, OperatorResult};

/// Either no epilogue or exactly one fused activation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FusedActivation {
    #[default]
    NoFusion,
    Fused(ActivationDesc),
}

impl FusedActivation {
    pub fn is_fused(&self) -> bool {
        matches!(self, FusedActivation::Fused(_))
    }

    /// Device-level descriptor to attach to the computation node.
    pub fn descriptor(&self) -> Option<ActivationDesc> {
        match self {
            FusedActivation::NoFusion => None,
            FusedActivation::Fused(desc) => Some(*desc),
        }
    }
}

fn resolve_param(
    attributes: &AttributeMap,
    name: &str,
    default: Option<f32>,
) -> OperatorResult<Option<f32>> {
    match default {
        // The kind takes no such parameter; a stray attribute is ignored.
        None => Ok(None),
        Some(default) => Ok(Some(attributes.get_or(name, default)?)),
    }
}

/// Reads the fusion attributes the host's fusion pass attached to this node.
///
/// `fused_activation` names the activation op; `fused_alpha`, `fused_beta` and `fused_gamma`
/// override the kind's defaults.
pub fn resolve_fused_activation(attributes: &AttributeMap) -> OperatorResult<FusedActivation> {
    let Some(name) = attributes.optional::<String>(names::FUSED_ACTIVATION)? else {
        return Ok(FusedActivation::NoFusion);
    };
    let kind = ActivationKind::from_op_name(&name).ok_or_else(|| {
        OperatorError::invalid_argument(
            BuildStage::Fuse,
            format!("activation '{name}' cannot be fused into batch normalization"),
        )
    })?;

    let (alpha, beta, gamma) = kind.default_params();
    let desc = ActivationDesc {
        kind,
        alpha: resolve_param(attributes, names::FUSED_ALPHA, alpha)?,
        beta: resolve_param(attributes, names::FUSED_BETA, beta)?,
        gamma: resolve_param(attributes, names::FUSED_GAMMA, gamma)?,
    };
    tracing::debug!(activation = kind.op_name(), ?desc, "resolved fused activation");
    Ok(FusedActivation::Fused(desc))
}
