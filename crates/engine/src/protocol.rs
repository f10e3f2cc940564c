//! Argument shapes of the calls exchanged between host and step runtimes.
//!
//! The host calls `invoke` on the child with [`InvocationArgs`]. The child
//! calls back into host capabilities (`emit`, `state.*`, `stream.operation`)
//! with the invocation id it was given, so the host can attribute the work
//! to the right trace. `log` carries a plain log entry.

use polystep_types::TraceContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Context bundle sent with every step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub trace_id: String,
    #[serde(default)]
    pub flows: Vec<String>,
    pub invocation_id: String,
    pub step: String,
}

impl InvocationContext {
    pub fn trace(&self) -> TraceContext {
        TraceContext::new(self.trace_id.clone(), self.flows.clone())
    }
}

/// Arguments of the `invoke` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationArgs {
    #[serde(default)]
    pub data: Value,
    pub context: InvocationContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitArgs {
    pub invocation_id: String,
    pub topic: String,
    #[serde(default)]
    pub data: Value,
}

/// Arguments of `state.get`, `state.delete` and, with a value, `state.set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateKeyArgs {
    pub invocation_id: String,
    pub group_id: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Arguments of `state.clear` and `state.getGroup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateGroupArgs {
    pub invocation_id: String,
    pub group_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOperationArgs {
    pub invocation_id: String,
    pub stream_name: String,
    pub operation: String,
    #[serde(default)]
    pub input: Value,
}
