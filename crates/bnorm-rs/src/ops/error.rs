use std::fmt;

use thiserror::Error;

use crate::backend::spec::BackendError;

/// Pipeline stage an operator error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStage {
    Normalize,
    Attributes,
    Coerce,
    Fuse,
    GraphBuild,
    Compile,
    Execute,
}

impl BuildStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStage::Normalize => "normalize",
            BuildStage::Attributes => "attributes",
            BuildStage::Coerce => "coerce",
            BuildStage::Fuse => "fuse",
            BuildStage::GraphBuild => "graph-build",
            BuildStage::Compile => "compile",
            BuildStage::Execute => "execute",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by operator construction, build and execution.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("invalid argument during {stage}: {message}")]
    InvalidArgument { stage: BuildStage, message: String },
    #[error("operator '{op_type}' is not supported: {reason}")]
    Unsupported { op_type: String, reason: String },
    #[error("kernel compilation failed on backend '{backend}': {source}")]
    Compilation {
        backend: String,
        #[source]
        source: BackendError,
    },
    #[error("kernel execution failed on backend '{backend}': {source}")]
    Execution {
        backend: String,
        #[source]
        source: BackendError,
    },
    #[error("operator is unusable after a failed build: {reason}")]
    Failed { reason: String },
    #[error("operator has not been built")]
    NotBuilt,
    #[error("invalid operator metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl OperatorError {
    pub fn invalid_argument(stage: BuildStage, message: impl Into<String>) -> Self {
        OperatorError::InvalidArgument {
            stage,
            message: message.into(),
        }
    }

    pub fn unsupported(op_type: impl Into<String>, reason: impl Into<String>) -> Self {
        OperatorError::Unsupported {
            op_type: op_type.into(),
            reason: reason.into(),
        }
    }

    /// Returns the stage the error is attributed to, when one applies.
    pub fn stage(&self) -> Option<BuildStage> {
        match self {
            OperatorError::InvalidArgument { stage, .. } => Some(*stage),
            OperatorError::Compilation { .. } => Some(BuildStage::Compile),
            OperatorError::Execution { .. } => Some(BuildStage::Execute),
            OperatorError::Metadata(_) => Some(BuildStage::Attributes),
            OperatorError::Unsupported { .. }
            | OperatorError::Failed { .. }
            | OperatorError::NotBuilt => None,
        }
    }
}

pub type OperatorResult<T> = Result<T, OperatorError>;
