//! Construction of the single-node batch-normalization graph.

use crate::backend::spec::{BatchNormSpec, Graph, GraphBuilder, Operation};
use crate::ops::batch_norm::BatchNormalizationParams;
use crate::ops::coercion::coerce_auxiliaries;
use crate::ops::error::{BuildStage, OperatorError, OperatorResult};
use crate::ops::fusion::FusedActivation;
use crate::ops::slots::{SlotMap, DEVICE_OPERAND_ORDER};
use crate::ops::tensor_desc::NormalizedTensors;

pub const GRAPH_NAME: &str = "batch_normalization";

/// A constructed graph plus bookkeeping about what construction inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltGraph {
    pub graph: Graph,
    pub cast_count: usize,
}

/// Builds `output = Normalize(input, mean, variance, scale, bias) [then activation]`.
///
/// Each graph input is named after its slot and bound to the slot's interchange ordinal, so the
/// caller's input array is never reordered; only the node's operands follow
/// [`DEVICE_OPERAND_ORDER`].
pub fn build_batch_norm_graph(
    tensors: &NormalizedTensors,
    params: &BatchNormalizationParams,
    fused: &FusedActivation,
) -> OperatorResult<BuiltGraph> {
    let mut builder = GraphBuilder::new();
    let mut values = SlotMap::from_fn(|slot| {
        builder.add_input(slot.name(), slot.ordinal(), tensors.input(slot).to_spec())
    });

    let primary_dtype = tensors.primary().dtype();
    let cast_count = coerce_auxiliaries(&mut builder, &mut values, primary_dtype)?;

    let operands = DEVICE_OPERAND_ORDER
        .iter()
        .map(|slot| *values.get(*slot))
        .collect::<Vec<_>>();
    let output_spec = tensors
        .outputs()
        .first()
        .map(|desc| desc.to_spec())
        .ok_or_else(|| {
            OperatorError::invalid_argument(BuildStage::GraphBuild, "no output descriptor")
        })?;
    let result = builder.emit(
        Operation::BatchNormalization(BatchNormSpec {
            epsilon: params.epsilon,
            spatial: params.spatial,
            fused_activation: fused.descriptor(),
        }),
        operands,
        output_spec,
    );

    let graph = builder
        .finish(GRAPH_NAME, vec![result])
        .map_err(|err| OperatorError::invalid_argument(BuildStage::GraphBuild, err.to_string()))?;
    Ok(BuiltGraph { graph, cast_count })
}
