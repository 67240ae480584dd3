//! Batch-normalization operator pipeline.
//!
//! Construction runs leaf-first: [`tensor_desc`] normalizes raw shapes, [`coercion`] and
//! [`fusion`] prepare the node, [`graph`] builds the device graph which [`batch_norm`] compiles
//! once, and [`dispatch`] binds buffers per call. [`registry`] is the host-facing entry point.
pub mod attributes;
pub mod batch_norm;
pub mod coercion;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod fusion;
pub mod graph;
pub mod registry;
pub mod slots;
pub mod tensor_desc;

pub use attributes::{AttributeMap, AttributeValue};
pub use batch_norm::{
    query_batch_normalization, BatchNormalizationOperator, BatchNormalizationParams,
    OperatorStatus,
};
pub use context::{KernelCreationContext, SupportQueryContext};
pub use error::{BuildStage, OperatorError, OperatorResult};
pub use fusion::FusedActivation;
pub use slots::InputSlot;
