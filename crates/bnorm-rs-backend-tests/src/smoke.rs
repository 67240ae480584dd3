use std::sync::Arc;

use anyhow::{ensure, Context};
use bnorm_rs::backend::spec::{ActivationDesc, ActivationKind, DType, Device, ExecutionFlags};
use bnorm_rs::ops::attributes::{names, AttributeValue};
use bnorm_rs::ops::batch_norm::{BatchNormalizationOperator, OperatorStatus};
use bnorm_rs::ops::error::{BuildStage, OperatorError};
use bnorm_rs::ops::registry::create_operator;

use crate::common::{
    assert_close_tol, download, fused_attributes, seeded_rng, upload, zeroed, BatchNormInputs,
    HostTensor,
};

const OP_TYPE: &str = "BatchNormalization";

fn run_once<D: Device>(
    device: &Arc<D>,
    operator: &BatchNormalizationOperator<D>,
    inputs: &BatchNormInputs,
) -> anyhow::Result<Vec<f64>> {
    let handles = inputs.upload(device.as_ref())?;
    let output = zeroed(device.as_ref(), &inputs.input.spec)?;
    let input_refs = handles.iter().collect::<Vec<_>>();
    operator.compute(&input_refs, &[&output])?;
    download(device.as_ref(), &output)
}

pub fn nchw_f32_matches_reference<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(7);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[2, 3, 4, 5]);
    let ctx = inputs
        .context(OP_TYPE)
        .with_attribute(names::EPSILON, AttributeValue::Float(1e-5));
    let operator = create_operator(Arc::clone(device), &ctx, ExecutionFlags::default())?;

    ensure!(operator.status() == OperatorStatus::Ready);
    ensure!(operator.cast_count() == Some(0), "matching dtypes need no casts");
    let actual = run_once(device, &operator, &inputs)?;
    assert_close_tol(&inputs.reference(1e-5, None), &actual, 1e-5, 1e-5);
    Ok(())
}

pub fn rank2_defaults_match_reference<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(11);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[6, 4]);
    let operator = create_operator(
        Arc::clone(device),
        &inputs.context(OP_TYPE),
        ExecutionFlags::default(),
    )?;
    ensure!(operator.params().epsilon == 0.0);
    ensure!(operator.params().spatial);
    let actual = run_once(device, &operator, &inputs)?;
    assert_close_tol(&inputs.reference(0.0, None), &actual, 1e-5, 1e-5);
    Ok(())
}

pub fn half_precision_scale_and_bias_are_cast<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(19);
    let mut inputs = BatchNormInputs::random(&mut rng, DType::F32, &[1, 3, 2, 2]);
    inputs.scale = HostTensor::new(DType::F16, &[3], inputs.scale.values.clone());
    inputs.bias = HostTensor::new(DType::F16, &[3], inputs.bias.values.clone());

    let operator = create_operator(
        Arc::clone(device),
        &inputs.context(OP_TYPE),
        ExecutionFlags::default(),
    )?;
    ensure!(operator.cast_count() == Some(2), "scale and bias each need one cast");
    let actual = run_once(device, &operator, &inputs)?;
    assert_close_tol(&inputs.reference(0.0, None), &actual, 1e-5, 1e-5);
    Ok(())
}

pub fn f16_end_to_end_matches_reference<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(23);
    let inputs = BatchNormInputs::random(&mut rng, DType::F16, &[2, 2, 3]);
    let ctx = inputs
        .context(OP_TYPE)
        .with_attribute(names::EPSILON, AttributeValue::Float(1e-3));
    let operator = create_operator(Arc::clone(device), &ctx, ExecutionFlags::default())?;
    let actual = run_once(device, &operator, &inputs)?;
    assert_close_tol(&inputs.reference(1e-3, None), &actual, 1e-2, 1e-2);
    Ok(())
}

pub fn fused_relu_clamps_negatives<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(29);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[2, 3, 3, 3]);
    let ctx = fused_attributes(inputs.context("FusedBatchNormalization"), ActivationKind::Relu, None);
    let operator = create_operator(Arc::clone(device), &ctx, ExecutionFlags::default())?;
    ensure!(operator.fused_activation().is_fused());

    let actual = run_once(device, &operator, &inputs)?;
    ensure!(actual.iter().all(|&v| v >= 0.0), "relu output must be non-negative");
    let expected = inputs.reference(0.0, Some(&ActivationDesc::new(ActivationKind::Relu)));
    assert_close_tol(&expected, &actual, 1e-5, 1e-5);
    Ok(())
}

pub fn fused_leaky_relu_uses_custom_alpha<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(31);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[1, 4, 5]);
    let ctx = fused_attributes(inputs.context(OP_TYPE), ActivationKind::LeakyRelu, Some(0.2));
    let operator = create_operator(Arc::clone(device), &ctx, ExecutionFlags::default())?;

    let mut desc = ActivationDesc::new(ActivationKind::LeakyRelu);
    desc.alpha = Some(0.2);
    let actual = run_once(device, &operator, &inputs)?;
    assert_close_tol(&inputs.reference(0.0, Some(&desc)), &actual, 1e-5, 1e-5);
    Ok(())
}

pub fn per_activation_statistics_without_spatial<D: Device>(
    device: &Arc<D>,
) -> anyhow::Result<()> {
    let mut rng = seeded_rng(37);
    let inputs = BatchNormInputs::random_with_stats(&mut rng, DType::F32, &[2, 3, 4], &[3, 4]);
    let ctx = inputs
        .context(OP_TYPE)
        .with_attribute(names::SPATIAL, AttributeValue::Int(0));
    let operator = create_operator(Arc::clone(device), &ctx, ExecutionFlags::default())?;
    ensure!(!operator.params().spatial);
    let actual = run_once(device, &operator, &inputs)?;
    assert_close_tol(&inputs.reference(0.0, None), &actual, 1e-5, 1e-5);
    Ok(())
}

pub fn repeated_compute_reuses_kernel<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(41);
    let first = BatchNormInputs::random(&mut rng, DType::F32, &[1, 2, 3]);
    let mut second = first.clone();
    second.input = HostTensor::random(&mut rng, DType::F32, &[1, 2, 3], -4.0, 4.0);

    let operator = create_operator(
        Arc::clone(device),
        &first.context(OP_TYPE),
        ExecutionFlags::default(),
    )?;
    let out_first = run_once(device, &operator, &first)?;
    let out_second = run_once(device, &operator, &second)?;
    assert_close_tol(&first.reference(0.0, None), &out_first, 1e-5, 1e-5);
    assert_close_tol(&second.reference(0.0, None), &out_second, 1e-5, 1e-5);
    ensure!(operator.is_ready());
    Ok(())
}

pub fn extra_outputs_are_accepted<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(43);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[2, 3, 2]);
    let stats_spec = inputs.mean.spec.clone();
    let ctx = inputs
        .context(OP_TYPE)
        .with_output(stats_spec.clone())
        .with_output(stats_spec.clone());
    let operator = create_operator(Arc::clone(device), &ctx, ExecutionFlags::default())?;

    let handles = inputs.upload(device.as_ref())?;
    let input_refs = handles.iter().collect::<Vec<_>>();
    let output = zeroed(device.as_ref(), &inputs.input.spec)?;
    let running_mean = zeroed(device.as_ref(), &stats_spec)?;
    let running_var = zeroed(device.as_ref(), &stats_spec)?;
    operator.compute(&input_refs, &[&output, &running_mean, &running_var])?;

    let actual = download(device.as_ref(), &output)?;
    assert_close_tol(&inputs.reference(0.0, None), &actual, 1e-5, 1e-5);
    ensure!(
        download(device.as_ref(), &running_mean)?.iter().all(|&v| v == 0.0),
        "optional statistics outputs are not produced"
    );
    Ok(())
}

pub fn compute_rejects_wrong_buffer_count<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(47);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[1, 2, 2]);
    let operator = create_operator(
        Arc::clone(device),
        &inputs.context(OP_TYPE),
        ExecutionFlags::default(),
    )?;
    let handles = inputs.upload(device.as_ref())?;
    let output = zeroed(device.as_ref(), &inputs.input.spec)?;
    let short = handles.iter().take(4).collect::<Vec<_>>();
    let err = operator
        .compute(&short, &[&output])
        .err()
        .context("four inputs must be rejected")?;
    ensure!(matches!(
        err,
        OperatorError::InvalidArgument {
            stage: BuildStage::Execute,
            ..
        }
    ));
    Ok(())
}

pub fn mismatched_statistics_dtype_fails_build<D: Device>(device: &Arc<D>) -> anyhow::Result<()> {
    let mut rng = seeded_rng(53);
    let mut inputs = BatchNormInputs::random(&mut rng, DType::F32, &[1, 2, 2]);
    inputs.mean = HostTensor::new(DType::F16, &[2], inputs.mean.values.clone());

    let mut operator = BatchNormalizationOperator::new(
        Arc::clone(device),
        &inputs.context(OP_TYPE),
        ExecutionFlags::default(),
    )?;
    let err = operator
        .build()
        .err()
        .context("uncoerced mean dtype must fail compilation")?;
    ensure!(matches!(err, OperatorError::Compilation { .. }), "got {err}");
    ensure!(operator.status() == OperatorStatus::Failed);

    let handles = inputs.upload(device.as_ref())?;
    let output = upload(device.as_ref(), &HostTensor::filled(DType::F32, &[1, 2, 2], 0.0))?;
    let input_refs = handles.iter().collect::<Vec<_>>();
    ensure!(matches!(
        operator.compute(&input_refs, &[&output]),
        Err(OperatorError::Failed { .. })
    ));
    Ok(())
}
