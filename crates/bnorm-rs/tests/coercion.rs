use bnorm_rs::backend::spec::{DType, GraphBuilder, Operation, TensorSpec, ValueId};
use bnorm_rs::ops::coercion::{coerce_auxiliaries, coerce_to, COERCED_SLOTS};
use bnorm_rs::ops::error::BuildStage;
use bnorm_rs::ops::slots::{InputSlot, SlotMap};

fn builder_with_inputs(dtypes: [DType; 5]) -> (GraphBuilder, SlotMap<ValueId>) {
    let mut builder = GraphBuilder::new();
    let values = SlotMap::from_fn(|slot| {
        let dims = if slot == InputSlot::Primary {
            vec![2, 3, 4]
        } else {
            vec![1, 3, 1]
        };
        builder.add_input(
            slot.name(),
            slot.ordinal(),
            TensorSpec::new(dtypes[slot.ordinal()], dims),
        )
    });
    (builder, values)
}

#[test]
fn matching_dtype_inserts_nothing() {
    let (mut builder, mut values) = builder_with_inputs([DType::F32; 5]);
    let before = values.clone();
    let casts = coerce_auxiliaries(&mut builder, &mut values, DType::F32).unwrap();
    assert_eq!(casts, 0);
    assert_eq!(builder.node_count(), 0);
    assert_eq!(values, before);
}

#[test]
fn only_scale_and_bias_are_cast() {
    let (mut builder, mut values) =
        builder_with_inputs([DType::F32, DType::F16, DType::F16, DType::F16, DType::F16]);
    let casts = coerce_auxiliaries(&mut builder, &mut values, DType::F32).unwrap();
    assert_eq!(casts, 2);
    assert_eq!(COERCED_SLOTS, [InputSlot::Scale, InputSlot::Bias]);

    for slot in COERCED_SLOTS {
        let spec = builder.value_spec(*values.get(slot)).unwrap();
        assert_eq!(spec.dtype, DType::F32, "{slot}");
        assert_eq!(spec.dims, vec![1, 3, 1]);
    }
    for slot in [InputSlot::Mean, InputSlot::Variance] {
        assert_eq!(builder.value_spec(*values.get(slot)).unwrap().dtype, DType::F16);
    }

    let graph = builder.finish("coerce", vec![*values.get(InputSlot::Scale)]).unwrap();
    assert_eq!(graph.count_nodes(|op| matches!(op, Operation::Cast(_))), 2);
}

#[test]
fn coercion_is_idempotent() {
    let (mut builder, values) =
        builder_with_inputs([DType::F32, DType::Bf16, DType::F32, DType::F32, DType::F32]);
    let once = coerce_to(&mut builder, *values.get(InputSlot::Scale), DType::F32).unwrap();
    let nodes = builder.node_count();
    let twice = coerce_to(&mut builder, once, DType::F32).unwrap();
    assert_eq!(once, twice);
    assert_eq!(builder.node_count(), nodes);
}

#[test]
fn unknown_value_is_reported() {
    let mut builder = GraphBuilder::new();
    let err = coerce_to(&mut builder, ValueId(42), DType::F32).unwrap_err();
    assert_eq!(err.stage(), Some(BuildStage::Coerce));
}
