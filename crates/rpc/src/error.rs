//! Error types for RPC sessions.

use std::time::Duration;
use thiserror::Error;

/// Failure of a local invocation or an outgoing call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("Handler for method {method} not found")]
    HandlerNotFound { method: String },

    #[error("Session {session} is closed")]
    ChannelClosed { session: String },

    #[error("Call to {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The peer answered with an error string.
    #[error("{message}")]
    Remote { method: String, message: String },

    #[error("Serialization failure: {reason}")]
    Serialization { reason: String },

    /// A local handler failed.
    #[error("{message}")]
    Handler { message: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

impl RpcError {
    /// Create a handler not found error.
    pub fn handler_not_found(method: impl Into<String>) -> Self {
        Self::HandlerNotFound { method: method.into() }
    }

    /// Create a channel closed error.
    pub fn channel_closed(session: impl Into<String>) -> Self {
        Self::ChannelClosed { session: session.into() }
    }

    /// Create a timeout error.
    pub fn timeout(method: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            method: method.into(),
            timeout,
        }
    }

    /// Create a remote error from the peer's stringified failure.
    pub fn remote(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization { reason: reason.into() }
    }

    /// Create a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler { message: message.into() }
    }

    /// Create a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(error: serde_json::Error) -> Self {
        RpcError::serialization(error.to_string())
    }
}
