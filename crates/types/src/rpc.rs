//! Message shapes exchanged with child runtimes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Correlated call or fire-and-forget notification, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcMessage {
    /// A call when `id` is present, a notification otherwise.
    RpcRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        method: String,
        #[serde(default)]
        args: Value,
    },
    RpcResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RpcMessage {
    pub fn request(id: impl Into<String>, method: impl Into<String>, args: Value) -> Self {
        RpcMessage::RpcRequest {
            id: Some(id.into()),
            method: method.into(),
            args,
        }
    }

    pub fn notification(method: impl Into<String>, args: Value) -> Self {
        RpcMessage::RpcRequest {
            id: None,
            method: method.into(),
            args,
        }
    }

    pub fn success(id: impl Into<String>, result: Value) -> Self {
        RpcMessage::RpcResponse {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        RpcMessage::RpcResponse {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// An inbound line after routing classification.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Rpc(RpcMessage),
    /// Anything that is not a well-formed RPC message; only observers see it.
    Other(Value),
}

impl InboundMessage {
    pub fn decode(raw: Value) -> Self {
        let tagged = matches!(
            raw.get("type").and_then(Value::as_str),
            Some("rpc_request" | "rpc_response")
        );
        if !tagged {
            return InboundMessage::Other(raw);
        }
        match serde_json::from_value::<RpcMessage>(raw.clone()) {
            Ok(message) => InboundMessage::Rpc(message),
            Err(_) => InboundMessage::Other(raw),
        }
    }
}

/// Closed set of methods either side of a session may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RpcMethod {
    /// Run the step handler inside the child.
    Invoke,
    Log,
    Emit,
    StateGet,
    StateSet,
    StateDelete,
    StateClear,
    StateGetGroup,
    StreamOperation,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 9] = [
        RpcMethod::Invoke,
        RpcMethod::Log,
        RpcMethod::Emit,
        RpcMethod::StateGet,
        RpcMethod::StateSet,
        RpcMethod::StateDelete,
        RpcMethod::StateClear,
        RpcMethod::StateGetGroup,
        RpcMethod::StreamOperation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::Invoke => "invoke",
            RpcMethod::Log => "log",
            RpcMethod::Emit => "emit",
            RpcMethod::StateGet => "state.get",
            RpcMethod::StateSet => "state.set",
            RpcMethod::StateDelete => "state.delete",
            RpcMethod::StateClear => "state.clear",
            RpcMethod::StateGetGroup => "state.getGroup",
            RpcMethod::StreamOperation => "stream.operation",
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown rpc method: {0}")]
pub struct UnknownMethodError(pub String);

impl FromStr for RpcMethod {
    type Err = UnknownMethodError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RpcMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == value)
            .ok_or_else(|| UnknownMethodError(value.to_string()))
    }
}
