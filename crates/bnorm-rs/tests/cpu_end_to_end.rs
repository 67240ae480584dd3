use std::sync::Arc;

use anyhow::Result;
use bnorm_rs::backend::spec::{ActivationDesc, ActivationKind, DType, ExecutionFlags};
use bnorm_rs::ops::attributes::{names, AttributeValue};
use bnorm_rs::ops::registry::create_operator;
use bnorm_rs_backend_ref_cpu::CpuDevice;
use bnorm_rs_backend_tests::common::{
    assert_close_tol, download, seeded_rng, zeroed, BatchNormInputs, HostTensor,
};

#[test]
fn rank5_hard_sigmoid_uses_default_parameters() -> Result<()> {
    let device = Arc::new(CpuDevice::new());
    let mut rng = seeded_rng(61);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[1, 2, 2, 2, 3]);
    let ctx = inputs
        .context("FusedBatchNormalization")
        .with_attribute(names::EPSILON, AttributeValue::Float(1e-4))
        .with_attribute(
            names::FUSED_ACTIVATION,
            AttributeValue::String("HardSigmoid".to_string()),
        );
    let operator = create_operator(Arc::clone(&device), &ctx, ExecutionFlags::default())?;

    let handles = inputs.upload(device.as_ref())?;
    let refs = handles.iter().collect::<Vec<_>>();
    let output = zeroed(device.as_ref(), &inputs.input.spec)?;
    operator.compute(&refs, &[&output])?;

    let mut desc = ActivationDesc::new(ActivationKind::HardSigmoid);
    desc.alpha = Some(0.2);
    desc.beta = Some(0.5);
    assert_close_tol(
        &inputs.reference(1e-4, Some(&desc)),
        &download(device.as_ref(), &output)?,
        1e-5,
        1e-5,
    );
    Ok(())
}

#[test]
fn bf16_scale_with_f32_input_is_cast_before_normalizing() -> Result<()> {
    let device = Arc::new(CpuDevice::new());
    let mut rng = seeded_rng(67);
    let mut inputs = BatchNormInputs::random(&mut rng, DType::F32, &[3, 4]);
    inputs.scale = HostTensor::new(DType::Bf16, &[4], inputs.scale.values.clone());

    let operator = create_operator(
        Arc::clone(&device),
        &inputs.context("BatchNormalization"),
        ExecutionFlags::default(),
    )?;
    assert_eq!(operator.cast_count(), Some(1));

    let handles = inputs.upload(device.as_ref())?;
    let refs = handles.iter().collect::<Vec<_>>();
    let output = zeroed(device.as_ref(), &inputs.input.spec)?;
    operator.compute(&refs, &[&output])?;
    assert_close_tol(
        &inputs.reference(0.0, None),
        &download(device.as_ref(), &output)?,
        1e-5,
        1e-5,
    );
    assert_eq!(device.execution_count(), 1);
    Ok(())
}
