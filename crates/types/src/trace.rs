//! Trace identity and the events that flow through a trace.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity of one logical end-to-end execution.
///
/// Created once per external trigger and copied, never mutated, into every
/// invocation and event of the chain it starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    #[serde(default)]
    pub flows: Vec<String>,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>, flows: Vec<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            flows,
        }
    }

    /// Starts a fresh trace with a random id.
    pub fn generate(flows: Vec<String>) -> Self {
        Self::new(generate_trace_id(), flows)
    }
}

/// Returns a new globally unique trace id.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// A topic publication carrying opaque data inside a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub topic: String,
    #[serde(default)]
    pub data: Value,
    pub trace_id: String,
    #[serde(default)]
    pub flows: Vec<String>,
}

impl Event {
    pub fn new(topic: impl Into<String>, data: Value, trace: &TraceContext) -> Self {
        Self {
            topic: topic.into(),
            data,
            trace_id: trace.trace_id.clone(),
            flows: trace.flows.clone(),
        }
    }

    pub fn trace(&self) -> TraceContext {
        TraceContext::new(self.trace_id.clone(), self.flows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_inherits_trace_identity() {
        let trace = TraceContext::new("t1", vec!["basic-tutorial".into()]);
        let event = Event::new("process-food-order", json!({"id": "o1"}), &trace);

        assert_eq!(event.trace(), trace);
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["traceId"], "t1");
        assert_eq!(wire["flows"][0], "basic-tutorial");
    }

    #[test]
    fn generated_trace_ids_are_unique() {
        let first = TraceContext::generate(Vec::new());
        let second = TraceContext::generate(Vec::new());
        assert_ne!(first.trace_id, second.trace_id);
    }
}
