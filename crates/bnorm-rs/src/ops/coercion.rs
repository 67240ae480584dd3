//! Element-type coercion of auxiliary operands.

use crate::backend::spec::{CastSpec, DType, GraphBuilder, Operation, TensorSpec, ValueId};
use crate::ops::error::{BuildStage, OperatorError, OperatorResult};
use crate::ops::slots::{InputSlot, SlotMap};

/// Slots cast to the primary dtype. Mean and variance are consumed as supplied.
pub const COERCED_SLOTS: [InputSlot; 2] = [InputSlot::Scale, InputSlot::Bias];

/// Returns `value` converted to `target`, emitting a cast only when the dtypes differ.
pub fn coerce_to(
    builder: &mut GraphBuilder,
    value: ValueId,
    target: DType,
) -> OperatorResult<ValueId> {
    let spec = builder.value_spec(value).ok_or_else(|| {
        OperatorError::invalid_argument(
            BuildStage::Coerce,
            format!("value %{} is not defined in the graph", value.0),
        )
    })?;
    if spec.dtype == target {
        return Ok(value);
    }
    let output = TensorSpec::new(target, spec.dims.clone());
    let source = spec.dtype;
    let cast = builder.emit(
        Operation::Cast(CastSpec { dtype: target }),
        vec![value],
        output,
    );
    tracing::debug!(from = %source, to = %target, value = value.0, "inserted cast");
    Ok(cast)
}

/// Coerces the [`COERCED_SLOTS`] values in place and returns how many casts were emitted.
pub fn coerce_auxiliaries(
    builder: &mut GraphBuilder,
    values: &mut SlotMap<ValueId>,
    target: DType,
) -> OperatorResult<usize> {
    let before = builder.node_count();
    for slot in COERCED_SLOTS {
        let coerced = coerce_to(builder, *values.get(slot), target)?;
        values.set(slot, coerced);
    }
    Ok(builder.node_count() - before)
}
