use bnorm_rs::backend::spec::{DType, TensorSpec};
use bnorm_rs::ops::context::KernelCreationContext;
use bnorm_rs::ops::error::{BuildStage, OperatorError};
use bnorm_rs::ops::slots::InputSlot;
use bnorm_rs::ops::tensor_desc::{normalize_tensors, TensorDesc, TensorPlacement};

fn spec(dtype: DType, dims: &[usize]) -> TensorSpec {
    TensorSpec::new(dtype, dims.to_vec())
}

fn context(input: &[usize], stats: &[usize]) -> KernelCreationContext {
    let mut ctx = KernelCreationContext::new("BatchNormalization").with_input(spec(DType::F32, input));
    for _ in 0..4 {
        ctx = ctx.with_input(spec(DType::F32, stats));
    }
    ctx.with_output(spec(DType::F32, input))
}

fn assert_normalize_error(ctx: &KernelCreationContext, needle: &str) {
    match normalize_tensors(ctx) {
        Err(OperatorError::InvalidArgument { stage, message }) => {
            assert_eq!(stage, BuildStage::Normalize);
            assert!(message.contains(needle), "{message:?} should mention {needle:?}");
        }
        other => panic!("expected a normalize error, got {other:?}"),
    }
}

#[test]
fn channel_statistics_expand_to_primary_rank() {
    let tensors = normalize_tensors(&context(&[2, 3, 4, 5], &[3])).unwrap();
    assert_eq!(tensors.rank(), 4);
    assert_eq!(tensors.inputs().len(), 5);
    assert_eq!(tensors.outputs().len(), 1);
    assert_eq!(tensors.primary().dims(), &[2, 3, 4, 5]);
    for slot in InputSlot::AUXILIARY {
        let desc = tensors.input(slot);
        assert_eq!(desc.dims(), &[1, 3, 1, 1], "{slot}");
        assert_eq!(desc.rank(), tensors.rank());
        assert_eq!(desc.non_singleton_axes(), vec![1]);
        assert_eq!(desc.placement(), TensorPlacement::ChannelAnchored);
    }
    assert_eq!(tensors.outputs()[0].placement(), TensorPlacement::BatchAnchored);
}

#[test]
fn rank2_input_places_channel_on_axis_one() {
    let tensors = normalize_tensors(&context(&[8, 16], &[16])).unwrap();
    assert_eq!(tensors.input(InputSlot::Scale).dims(), &[1, 16]);
}

#[test]
fn per_activation_statistics_stay_left_aligned() {
    let tensors = normalize_tensors(&context(&[2, 3, 4, 5], &[3, 4])).unwrap();
    assert_eq!(tensors.input(InputSlot::Mean).dims(), &[1, 3, 4, 1]);
}

#[test]
fn placement_never_flattens_dims() {
    let placed = TensorDesc::place(&spec(DType::F16, &[3]), TensorPlacement::ChannelAnchored, 5)
        .unwrap();
    assert_eq!(placed.dims(), &[1, 3, 1, 1, 1]);
    assert_eq!(placed.dtype(), DType::F16);
    assert!(
        TensorDesc::place(&spec(DType::F32, &[2, 3, 4]), TensorPlacement::ChannelAnchored, 3)
            .is_err()
    );
}

#[test]
fn input_count_must_be_exactly_five() {
    let mut four = KernelCreationContext::new("BatchNormalization");
    for _ in 0..4 {
        four = four.with_input(spec(DType::F32, &[2, 3]));
    }
    assert_normalize_error(&four.with_output(spec(DType::F32, &[2, 3])), "exactly 5 inputs");

    let six = context(&[2, 3], &[3]).with_input(spec(DType::F32, &[3]));
    assert_normalize_error(&six, "exactly 5 inputs");
}

#[test]
fn at_least_one_output_is_required() {
    let mut ctx = context(&[2, 3], &[3]);
    ctx.outputs.clear();
    assert_normalize_error(&ctx, "at least one output");
}

#[test]
fn absent_input_is_rejected() {
    let ctx = KernelCreationContext::new("BatchNormalization")
        .with_input(spec(DType::F32, &[2, 3]))
        .with_input(spec(DType::F32, &[3]))
        .with_missing_input()
        .with_input(spec(DType::F32, &[3]))
        .with_input(spec(DType::F32, &[3]))
        .with_output(spec(DType::F32, &[2, 3]));
    assert_normalize_error(&ctx, "'bias' is absent");
}

#[test]
fn primary_without_channel_axis_is_rejected() {
    assert_normalize_error(&context(&[3], &[3]), "rank >= 2");
}

#[test]
fn statistics_must_match_channel_count() {
    assert_normalize_error(&context(&[2, 3, 4], &[5]), "does not broadcast");
}

#[test]
fn statistics_rank_must_fit_behind_batch_axis() {
    assert_normalize_error(&context(&[2, 3], &[3, 1]), "does not fit");
}

#[test]
fn output_must_match_primary_shape_and_dtype() {
    let mut ctx = context(&[2, 3, 4], &[3]);
    ctx.outputs[0] = spec(DType::F32, &[2, 3, 5]);
    assert_normalize_error(&ctx, "output 0 dims");

    ctx.outputs[0] = spec(DType::F16, &[2, 3, 4]);
    assert_normalize_error(&ctx, "output 0 dtype");
}

#[test]
fn extra_outputs_are_channel_anchored() {
    let ctx = context(&[2, 3, 4], &[3])
        .with_output(spec(DType::F32, &[3]))
        .with_output(spec(DType::F32, &[3]));
    let tensors = normalize_tensors(&ctx).unwrap();
    assert_eq!(tensors.outputs().len(), 3);
    assert_eq!(tensors.outputs()[1].dims(), &[1, 3, 1]);
}
