pub mod backend;
mod env;
pub mod ops;

pub use backend::spec::{DType, Device, ExecutionFlags, Graph, TensorSpec};
pub use ops::{
    BatchNormalizationOperator, KernelCreationContext, OperatorError, OperatorResult,
    OperatorStatus,
};
