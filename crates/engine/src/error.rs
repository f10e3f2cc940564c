//! Error types for event dispatch.

use polystep_rpc::RpcError;
use thiserror::Error;

use crate::state::StateError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown step '{name}'")]
    UnknownStep { name: String },

    #[error("Unknown invocation '{id}'")]
    UnknownInvocation { id: String },

    #[error("Failed to start runtime for step '{step}': {reason}")]
    Runtime { step: String, reason: String },

    #[error("Invalid step configuration: {reason}")]
    InvalidSteps { reason: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl DispatchError {
    pub fn unknown_step(name: impl Into<String>) -> Self {
        Self::UnknownStep { name: name.into() }
    }

    pub fn unknown_invocation(id: impl Into<String>) -> Self {
        Self::UnknownInvocation { id: id.into() }
    }

    pub fn runtime(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Runtime {
            step: step.into(),
            reason: reason.into(),
        }
    }
}

/// Host capability failures travel back to the child as stringified errors.
impl From<DispatchError> for RpcError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::Rpc(error) => error,
            other => RpcError::handler(other.to_string()),
        }
    }
}
