use std::sync::Arc;

use bnorm_rs::backend::spec::{DType, ExecutionFlags, TensorSpec};
use bnorm_rs::ops::attributes::{names, AttributeMap, AttributeValue};
use bnorm_rs::ops::batch_norm::query_batch_normalization;
use bnorm_rs::ops::context::{KernelCreationContext, SupportQueryContext};
use bnorm_rs::ops::error::OperatorError;
use bnorm_rs::ops::registry::{
    create_operator, find_registration, is_supported, register_operator, registered_operators,
    OperatorRegistration, DEFAULT_DOMAIN,
};
use bnorm_rs_backend_tests::recording_device::RecordingDevice;

fn training(mode: i64) -> AttributeMap {
    AttributeMap::new().with(names::TRAINING_MODE, AttributeValue::Int(mode))
}

fn context(op_type: &str) -> KernelCreationContext {
    let stats = TensorSpec::new(DType::F32, vec![4]);
    KernelCreationContext::new(op_type)
        .with_input(TensorSpec::new(DType::F32, vec![1, 4, 2, 2]))
        .with_input(stats.clone())
        .with_input(stats.clone())
        .with_input(stats.clone())
        .with_input(stats)
        .with_output(TensorSpec::new(DType::F32, vec![1, 4, 2, 2]))
}

#[test]
fn support_query_accepts_inference_only() {
    let absent = AttributeMap::new();
    assert!(query_batch_normalization(&SupportQueryContext::new("BatchNormalization", &absent)));
    let zero = training(0);
    assert!(query_batch_normalization(&SupportQueryContext::new("BatchNormalization", &zero)));
    let one = training(1);
    assert!(!query_batch_normalization(&SupportQueryContext::new("BatchNormalization", &one)));
    let malformed = AttributeMap::new().with(names::TRAINING_MODE, AttributeValue::Float(0.0));
    assert!(!query_batch_normalization(&SupportQueryContext::new(
        "BatchNormalization",
        &malformed
    )));
}

#[test]
fn builtin_operator_types_are_registered() {
    let names = registered_operators()
        .iter()
        .map(|registration| registration.op_type)
        .collect::<Vec<_>>();
    for op_type in [
        "BatchNormalization",
        "BatchNormalization15",
        "FusedBatchNormalization",
    ] {
        assert!(names.contains(&op_type), "{op_type} missing from {names:?}");
    }
    let legacy = find_registration("BatchNormalization").unwrap();
    assert_eq!(legacy.since_versions, &[7, 9]);
    assert_eq!(legacy.domain, DEFAULT_DOMAIN);
}

#[test]
fn unknown_operator_types_are_unsupported() {
    let attrs = AttributeMap::new();
    assert!(!is_supported(&SupportQueryContext::new("LayerNormalization", &attrs)));
    assert!(is_supported(&SupportQueryContext::new("BatchNormalization15", &attrs)));
}

#[test]
fn training_mode_prevents_construction() {
    let device = Arc::new(RecordingDevice::new());
    let ctx = context("BatchNormalization")
        .with_attribute(names::TRAINING_MODE, AttributeValue::Int(1));
    let err = create_operator(Arc::clone(&device), &ctx, ExecutionFlags::default()).unwrap_err();
    assert!(matches!(err, OperatorError::Unsupported { .. }));
    assert_eq!(device.compile_calls(), 0);
}

#[test]
fn unregistered_type_is_refused() {
    let device = Arc::new(RecordingDevice::new());
    let err = create_operator(device, &context("InstanceNormalization"), ExecutionFlags::default())
        .unwrap_err();
    assert!(matches!(err, OperatorError::Unsupported { ref op_type, .. } if op_type == "InstanceNormalization"));
}

#[test]
fn every_registered_type_creates_a_ready_operator() {
    for op_type in ["BatchNormalization", "BatchNormalization15", "FusedBatchNormalization"] {
        let device = Arc::new(RecordingDevice::new());
        let operator =
            create_operator(Arc::clone(&device), &context(op_type), ExecutionFlags::default())
                .unwrap();
        assert!(operator.is_ready());
        assert_eq!(operator.op_type(), op_type);
        assert_eq!(device.compile_calls(), 1);
    }
}

#[test]
fn hosts_can_register_aliases() {
    let alias = OperatorRegistration {
        op_type: "SpatialBatchNormalization",
        domain: "org.example",
        since_versions: &[1],
        query: query_batch_normalization,
    };
    assert!(register_operator(alias).is_none());
    let device = Arc::new(RecordingDevice::new());
    let operator = create_operator(
        device,
        &context("SpatialBatchNormalization"),
        ExecutionFlags::default(),
    )
    .unwrap();
    assert!(operator.is_ready());
}

#[test]
fn context_deserializes_from_json() {
    let json = r#"{
        "op_type": "BatchNormalization",
        "inputs": [
            {"dtype": "F32", "dims": [1, 2, 3]},
            {"dtype": "F16", "dims": [2]},
            {"dtype": "F16", "dims": [2]},
            {"dtype": "F32", "dims": [2]},
            null
        ],
        "outputs": [{"dtype": "F32", "dims": [1, 2, 3]}],
        "attributes": {"epsilon": {"kind": "Float", "value": 0.001}}
    }"#;
    let ctx = KernelCreationContext::from_json_str(json).unwrap();
    assert_eq!(ctx.input_count(), 5);
    assert!(ctx.input(4).is_none());
    assert_eq!(
        ctx.attributes.get(names::EPSILON),
        Some(&AttributeValue::Float(0.001))
    );
    assert!(matches!(
        KernelCreationContext::from_json_str("{"),
        Err(OperatorError::Metadata(_))
    ));
}
