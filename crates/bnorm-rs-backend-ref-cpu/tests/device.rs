use std::sync::Arc;

use bnorm_rs::backend::spec::{
    BackendError, CastSpec, DType, Device, ExecutionFlags, ExecutionPreference, GraphBuilder,
    Operation, SpecErrorCode, TensorInit, TensorSpec,
};
use bnorm_rs::ops::attributes::{names, AttributeValue};
use bnorm_rs::ops::batch_norm::{BatchNormalizationOperator, OperatorStatus};
use bnorm_rs::ops::error::OperatorError;
use bnorm_rs::ops::registry::create_operator;
use bnorm_rs_backend_ref_cpu::{CpuDevice, CpuTensor, TensorData};
use bnorm_rs_backend_tests::common::{
    assert_close_tol, download, literal_values, seeded_rng, upload, zeroed, BatchNormInputs,
    HostTensor,
};

#[test]
fn literal_roundtrip_preserves_half_values() {
    let device = CpuDevice::new();
    let host = HostTensor::new(DType::F16, &[2, 2], vec![0.5, -1.25, 3.0, 65504.0]);
    let handle = device
        .materialize(TensorInit::Literal(host.to_literal().unwrap()))
        .unwrap();
    let literal = device.to_literal(&handle).unwrap();
    assert_eq!(literal.spec, host.spec);
    assert_eq!(literal_values(&literal).unwrap(), host.values);
}

#[test]
fn zeroed_buffers_have_the_requested_dtype() {
    let tensor = CpuTensor::zeroed(TensorSpec::new(DType::Bf16, vec![3])).unwrap();
    assert!(matches!(&*tensor.read(), TensorData::Bf16(values) if values.len() == 3));
}

#[test]
fn buffers_reject_mismatched_payloads() {
    let spec = TensorSpec::new(DType::F32, vec![2, 2]);
    let err = CpuTensor::new(spec.clone(), TensorData::F64(vec![0.0; 4])).unwrap_err();
    assert!(matches!(
        err,
        BackendError::SpecViolation(ref spec_err) if spec_err.code == SpecErrorCode::DTypeMismatch
    ));
    assert!(CpuTensor::new(spec, TensorData::F32(vec![0.0; 3])).is_err());
}

#[test]
fn identical_graphs_share_one_compiled_plan() {
    let device = Arc::new(CpuDevice::new());
    let mut rng = seeded_rng(3);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[1, 2, 2]);
    let ctx = inputs.context("BatchNormalization");

    let first = create_operator(Arc::clone(&device), &ctx, ExecutionFlags::default()).unwrap();
    let second = create_operator(Arc::clone(&device), &ctx, ExecutionFlags::default()).unwrap();
    assert_eq!(first.graph(), second.graph());
    assert_eq!(device.compilation_count(), 1);

    let memory = ExecutionFlags::default().with_preference(ExecutionPreference::ConserveMemory);
    let _third = create_operator(Arc::clone(&device), &ctx, memory).unwrap();
    assert_eq!(device.compilation_count(), 2);
    assert_eq!(device.cached_kernel_count(), 2);
}

#[test]
fn spatial_mode_rejects_per_activation_statistics() {
    let device = Arc::new(CpuDevice::new());
    let mut rng = seeded_rng(5);
    let inputs = BatchNormInputs::random_with_stats(&mut rng, DType::F32, &[2, 3, 4], &[3, 4]);

    let mut operator = BatchNormalizationOperator::new(
        Arc::clone(&device),
        &inputs.context("BatchNormalization"),
        ExecutionFlags::default(),
    )
    .unwrap();
    let err = operator.build().unwrap_err();
    assert!(matches!(err, OperatorError::Compilation { ref backend, .. } if backend == "cpu"));
    assert_eq!(operator.status(), OperatorStatus::Failed);
    assert_eq!(device.compilation_count(), 0);
}

#[test]
fn negative_epsilon_is_rejected_at_compile_time() {
    let device = Arc::new(CpuDevice::new());
    let mut rng = seeded_rng(9);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[1, 2]);
    let ctx = inputs
        .context("BatchNormalization")
        .with_attribute(names::EPSILON, AttributeValue::Float(-1.0));
    let err = create_operator(Arc::clone(&device), &ctx, ExecutionFlags::default()).unwrap_err();
    assert!(matches!(err, OperatorError::Compilation { .. }));
}

#[test]
fn execute_rejects_buffers_of_the_wrong_dtype() {
    let device = Arc::new(CpuDevice::new());
    let mut rng = seeded_rng(13);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[1, 2, 3]);
    let operator = create_operator(
        Arc::clone(&device),
        &inputs.context("BatchNormalization"),
        ExecutionFlags::default(),
    )
    .unwrap();

    let handles = inputs.upload(device.as_ref()).unwrap();
    let refs = handles.iter().collect::<Vec<_>>();
    let wrong = zeroed(device.as_ref(), &TensorSpec::new(DType::F64, vec![1, 2, 3])).unwrap();
    let err = operator.compute(&refs, &[&wrong]).unwrap_err();
    assert!(matches!(err, OperatorError::Execution { .. }));
    assert_eq!(device.execution_count(), 0);
    assert!(operator.is_ready(), "an execution error does not poison the kernel");
}

#[test]
fn constant_channel_normalizes_to_bias() {
    let device = Arc::new(CpuDevice::new());
    let inputs = BatchNormInputs {
        input: HostTensor::filled(DType::F32, &[2, 2, 2], 3.0),
        scale: HostTensor::new(DType::F32, &[2], vec![1.0, 2.0]),
        bias: HostTensor::new(DType::F32, &[2], vec![0.5, -0.5]),
        mean: HostTensor::new(DType::F32, &[2], vec![3.0, 3.0]),
        variance: HostTensor::new(DType::F32, &[2], vec![1.0, 1.0]),
    };
    let operator = create_operator(
        Arc::clone(&device),
        &inputs.context("BatchNormalization15"),
        ExecutionFlags::default(),
    )
    .unwrap();
    let handles = inputs.upload(device.as_ref()).unwrap();
    let refs = handles.iter().collect::<Vec<_>>();
    let output = upload(device.as_ref(), &HostTensor::filled(DType::F32, &[2, 2, 2], 9.0)).unwrap();
    operator.compute(&refs, &[&output]).unwrap();
    assert_eq!(
        download(device.as_ref(), &output).unwrap(),
        vec![0.5, 0.5, -0.5, -0.5, 0.5, 0.5, -0.5, -0.5]
    );
}

fn spec_error_code(err: &BackendError) -> Option<&SpecErrorCode> {
    match err {
        BackendError::SpecViolation(spec_err) => Some(&spec_err.code),
        _ => None,
    }
}

#[test]
fn out_of_range_output_ordinal_fails_compilation() {
    let device = CpuDevice::new();
    let mut rng = seeded_rng(71);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[1, 2, 2]);
    let operator = create_operator(
        Arc::new(CpuDevice::new()),
        &inputs.context("BatchNormalization"),
        ExecutionFlags::default(),
    )
    .unwrap();
    let mut graph = operator.graph().unwrap().clone();
    graph.outputs[0].ordinal = 3;

    let err = device.compile(&graph, ExecutionFlags::default()).unwrap_err();
    assert_eq!(
        spec_error_code(&err),
        Some(&SpecErrorCode::InvalidAttributeValue)
    );
    assert_eq!(device.compilation_count(), 0);
}

#[test]
fn casts_to_unstorable_dtypes_fail_compilation() {
    let device = CpuDevice::new();
    let mut builder = GraphBuilder::new();
    let input = builder.add_input("input", 0, TensorSpec::new(DType::F32, vec![4]));
    let cast = builder.emit(
        Operation::Cast(CastSpec { dtype: DType::Si8 }),
        vec![input],
        TensorSpec::new(DType::Si8, vec![4]),
    );
    let graph = builder.finish("cast_only", vec![cast]).unwrap();

    let err = device.compile(&graph, ExecutionFlags::default()).unwrap_err();
    assert_eq!(
        spec_error_code(&err),
        Some(&SpecErrorCode::DTypeNotSupported)
    );
}

#[test]
fn half_precision_intermediates_need_the_flag_and_a_half_input() {
    let device = Arc::new(CpuDevice::new());
    let mut rng = seeded_rng(73);
    let half = BatchNormInputs::random(&mut rng, DType::F16, &[1, 2, 3]);
    let single = BatchNormInputs::random(&mut rng, DType::F32, &[1, 2, 3]);
    let strict = ExecutionFlags::default().with_half_precision_computation(false);
    let relaxed = strict.with_half_precision_computation(true);

    let compute_dtype = |inputs: &BatchNormInputs, flags: ExecutionFlags| {
        let operator =
            create_operator(Arc::clone(&device), &inputs.context("BatchNormalization"), flags)
                .unwrap();
        let kernel = device.compile(operator.graph().unwrap(), flags).unwrap();
        kernel.compiled().compute_dtype()
    };
    assert_eq!(compute_dtype(&half, strict), Some(DType::F64));
    assert_eq!(compute_dtype(&half, relaxed), Some(DType::F16));
    assert_eq!(compute_dtype(&single, relaxed), Some(DType::F64));

    let operator = create_operator(
        Arc::clone(&device),
        &half.context("BatchNormalization"),
        relaxed,
    )
    .unwrap();
    let handles = half.upload(device.as_ref()).unwrap();
    let refs = handles.iter().collect::<Vec<_>>();
    let output = zeroed(device.as_ref(), &half.input.spec).unwrap();
    operator.compute(&refs, &[&output]).unwrap();
    assert_close_tol(
        &half.reference(0.0, None),
        &download(device.as_ref(), &output).unwrap(),
        1e-2,
        1e-2,
    );
}

#[test]
fn clearing_the_cache_forces_recompilation() {
    let device = Arc::new(CpuDevice::new());
    let mut rng = seeded_rng(79);
    let inputs = BatchNormInputs::random(&mut rng, DType::F32, &[2, 2]);
    let ctx = inputs.context("BatchNormalization");

    let first = create_operator(Arc::clone(&device), &ctx, ExecutionFlags::default()).unwrap();
    device.clear_kernel_cache();
    assert_eq!(device.cached_kernel_count(), 0);
    let _second = create_operator(Arc::clone(&device), &ctx, ExecutionFlags::default()).unwrap();
    assert_eq!(device.compilation_count(), 2);
    assert_eq!(device.cached_kernel_count(), 1);

    let handles = inputs.upload(device.as_ref()).unwrap();
    let refs = handles.iter().collect::<Vec<_>>();
    let output = zeroed(device.as_ref(), &inputs.input.spec).unwrap();
    first.compute(&refs, &[&output]).unwrap();
}
