//! In-memory record of traces and the spans of each step invocation.
//!
//! A trace group holds every step invocation of one trace id. Each
//! invocation owns a [`Trace`] with its spans. The store keeps a bounded
//! number of groups and evicts the oldest by start time.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use indexmap::IndexMap;
use polystep_types::StepType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_MAX_TRACE_GROUPS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    State,
    Emit,
    Stream,
}

/// One recorded operation inside a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanOperation {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub timestamp: i64,
}

/// Consecutive operations of one kind, coalesced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    pub kind: SpanKind,
    /// Topic for emit spans, stream name for stream spans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub calls: u32,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub operations: Vec<SpanOperation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl TraceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            stack: (!causes.is_empty()).then(|| causes.join("\n")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    #[serde(rename = "type")]
    pub entry_type: StepType,
    pub step_name: String,
}

/// Spans of one step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Id of the owning group, which is the trace id.
    pub parent_trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_trace: Option<String>,
    pub status: TraceStatus,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub entry_point: EntryPoint,
    pub spans: Vec<TraceSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TraceError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceGroupMetadata {
    pub completed_steps: u32,
    pub active_steps: u32,
    pub total_steps: u32,
}

/// Everything recorded under one trace id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceGroup {
    pub id: String,
    /// Name of the first step that ran under this trace.
    pub name: String,
    pub last_activity: i64,
    pub metadata: TraceGroupMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub status: TraceStatus,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

/// Address of one invocation record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceKey {
    pub group_id: String,
    pub trace_id: String,
}

/// Operation handed to [`TraceStore::record`].
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub kind: SpanKind,
    pub name: Option<String>,
    pub operation: SpanOperation,
}

#[derive(Debug, Default)]
struct StoreInner {
    groups: IndexMap<String, TraceGroup>,
    traces: HashMap<String, Vec<Trace>>,
}

/// Bounded store of trace groups.
#[derive(Debug)]
pub struct TraceStore {
    inner: Mutex<StoreInner>,
    max_groups: usize,
}

impl TraceStore {
    pub fn new(max_groups: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            max_groups: max_groups.max(1),
        }
    }

    pub fn max_groups(&self) -> usize {
        self.max_groups
    }

    /// Opens a running record for a step invocation, creating its group on
    /// first use.
    pub fn start_trace(
        &self,
        group_id: &str,
        step_name: &str,
        entry_type: StepType,
        parent: Option<&TraceKey>,
    ) -> TraceKey {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.lock();
        if !inner.groups.contains_key(group_id) {
            self.evict_oldest(&mut inner);
            inner.groups.insert(
                group_id.to_string(),
                TraceGroup {
                    id: group_id.to_string(),
                    name: step_name.to_string(),
                    last_activity: now,
                    metadata: TraceGroupMetadata::default(),
                    correlation_id: None,
                    status: TraceStatus::Running,
                    start_time: now,
                    end_time: None,
                },
            );
        }
        if let Some(group) = inner.groups.get_mut(group_id) {
            group.metadata.total_steps += 1;
            group.metadata.active_steps += 1;
            group.last_activity = now;
            group.status = TraceStatus::Running;
            group.end_time = None;
        }

        let key = TraceKey {
            group_id: group_id.to_string(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        };
        inner.traces.entry(group_id.to_string()).or_default().push(Trace {
            id: key.trace_id.clone(),
            name: step_name.to_string(),
            correlation_id: None,
            parent_trace_id: group_id.to_string(),
            parent_span_trace: parent.map(|parent| parent.trace_id.clone()),
            status: TraceStatus::Running,
            start_time: now,
            end_time: None,
            entry_point: EntryPoint {
                entry_type,
                step_name: step_name.to_string(),
            },
            spans: Vec::new(),
            error: None,
        });
        key
    }

    /// Appends an operation, extending the last span when it has the same
    /// kind and name.
    pub fn record(&self, key: &TraceKey, record: SpanRecord) {
        let mut inner = self.lock();
        let Some(trace) = find_trace(&mut inner, key) else {
            return;
        };
        if trace.status != TraceStatus::Running {
            return;
        }
        let timestamp = record.operation.timestamp;
        let extends_last = trace.spans.last().is_some_and(|span| {
            span.kind == record.kind && span.name == record.name && span.end_time.is_none()
        });
        if extends_last && let Some(span) = trace.spans.last_mut() {
            span.calls += 1;
            span.operations.push(record.operation);
        } else {
            if let Some(previous) = trace.spans.last_mut()
                && previous.end_time.is_none()
            {
                previous.end_time = Some(timestamp);
            }
            trace.spans.push(TraceSpan {
                kind: record.kind,
                name: record.name,
                calls: 1,
                start_time: timestamp,
                end_time: None,
                operations: vec![record.operation],
            });
        }
        if let Some(group) = inner.groups.get_mut(&key.group_id) {
            group.last_activity = timestamp;
        }
    }

    /// Closes an invocation record. Returns `false` if it was already closed
    /// or no longer exists.
    pub fn end_trace(&self, key: &TraceKey, error: Option<TraceError>) -> bool {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.lock();
        let Some(trace) = find_trace(&mut inner, key) else {
            return false;
        };
        if trace.status != TraceStatus::Running {
            return false;
        }
        trace.status = if error.is_some() {
            TraceStatus::Failed
        } else {
            TraceStatus::Completed
        };
        trace.end_time = Some(now);
        trace.error = error;
        for span in &mut trace.spans {
            span.end_time.get_or_insert(now);
        }
        if let Some(group) = inner.groups.get_mut(&key.group_id) {
            group.metadata.active_steps = group.metadata.active_steps.saturating_sub(1);
            group.metadata.completed_steps += 1;
            group.last_activity = now;
        }
        true
    }

    /// Drops an invocation record without closing it.
    pub fn discard_trace(&self, key: &TraceKey) {
        let mut inner = self.lock();
        let Some(traces) = inner.traces.get_mut(&key.group_id) else {
            return;
        };
        let Some(position) = traces.iter().position(|trace| trace.id == key.trace_id) else {
            return;
        };
        let removed = traces.remove(position);
        if let Some(group) = inner.groups.get_mut(&key.group_id) {
            group.metadata.total_steps = group.metadata.total_steps.saturating_sub(1);
            if removed.status == TraceStatus::Running {
                group.metadata.active_steps = group.metadata.active_steps.saturating_sub(1);
            } else {
                group.metadata.completed_steps = group.metadata.completed_steps.saturating_sub(1);
            }
        }
    }

    /// Marks a group finished once nothing is pending under its trace id.
    pub fn complete_group(&self, group_id: &str) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.lock();
        let failed = inner
            .traces
            .get(group_id)
            .is_some_and(|traces| traces.iter().any(|trace| trace.status == TraceStatus::Failed));
        if let Some(group) = inner.groups.get_mut(group_id)
            && group.metadata.active_steps == 0
        {
            group.status = if failed {
                TraceStatus::Failed
            } else {
                TraceStatus::Completed
            };
            group.end_time = Some(now);
            group.last_activity = now;
        }
    }

    /// Groups, newest first.
    pub fn groups(&self) -> Vec<TraceGroup> {
        let inner = self.lock();
        let mut groups: Vec<TraceGroup> = inner.groups.values().cloned().collect();
        groups.sort_by(|left, right| right.start_time.cmp(&left.start_time));
        groups
    }

    pub fn group(&self, group_id: &str) -> Option<TraceGroup> {
        self.lock().groups.get(group_id).cloned()
    }

    pub fn traces(&self, group_id: &str) -> Option<Vec<Trace>> {
        let inner = self.lock();
        inner.groups.get(group_id)?;
        Some(inner.traces.get(group_id).cloned().unwrap_or_default())
    }

    pub fn trace(&self, key: &TraceKey) -> Option<Trace> {
        let inner = self.lock();
        inner
            .traces
            .get(&key.group_id)?
            .iter()
            .find(|trace| trace.id == key.trace_id)
            .cloned()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.groups.clear();
        inner.traces.clear();
    }

    fn evict_oldest(&self, inner: &mut StoreInner) {
        while inner.groups.len() >= self.max_groups {
            let oldest = inner
                .groups
                .values()
                .min_by_key(|group| group.start_time)
                .map(|group| group.id.clone());
            let Some(oldest) = oldest else {
                break;
            };
            inner.groups.shift_remove(&oldest);
            inner.traces.remove(&oldest);
            debug!(trace_id = %oldest, "Evicted trace group");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACE_GROUPS)
    }
}

fn find_trace<'a>(inner: &'a mut StoreInner, key: &TraceKey) -> Option<&'a mut Trace> {
    inner
        .traces
        .get_mut(&key.group_id)?
        .iter_mut()
        .find(|trace| trace.id == key.trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_op(operation: &str) -> SpanRecord {
        SpanRecord {
            kind: SpanKind::State,
            name: None,
            operation: SpanOperation {
                operation: operation.to_string(),
                input: json!({"key": "order"}),
                success: None,
                timestamp: Utc::now().timestamp_millis(),
            },
        }
    }

    #[test]
    fn consecutive_operations_of_one_kind_share_a_span() {
        let store = TraceStore::default();
        let key = store.start_trace("t1", "process-food-order", StepType::Event, None);
        store.record(&key, state_op("get"));
        store.record(&key, state_op("set"));
        store.record(
            &key,
            SpanRecord {
                kind: SpanKind::Emit,
                name: Some("new-order-notification".to_string()),
                operation: SpanOperation {
                    operation: "emit".to_string(),
                    input: Value::Null,
                    success: Some(true),
                    timestamp: Utc::now().timestamp_millis(),
                },
            },
        );
        store.record(&key, state_op("delete"));

        let trace = store.trace(&key).unwrap();
        let shape: Vec<(SpanKind, u32)> = trace.spans.iter().map(|span| (span.kind, span.calls)).collect();
        assert_eq!(shape, vec![(SpanKind::State, 2), (SpanKind::Emit, 1), (SpanKind::State, 1)]);
        assert!(trace.spans[0].end_time.is_some());
    }

    #[test]
    fn group_metadata_tracks_step_lifecycle() {
        let store = TraceStore::default();
        let first = store.start_trace("t1", "a", StepType::Event, None);
        let second = store.start_trace("t1", "b", StepType::Event, Some(&first));
        assert_eq!(store.group("t1").unwrap().metadata.active_steps, 2);

        assert!(store.end_trace(&first, None));
        assert!(!store.end_trace(&first, None));
        store.complete_group("t1");
        assert_eq!(store.group("t1").unwrap().status, TraceStatus::Running);

        store.end_trace(&second, Some(TraceError::new("boom")));
        store.complete_group("t1");
        let group = store.group("t1").unwrap();
        assert_eq!(group.status, TraceStatus::Failed);
        assert_eq!(
            group.metadata,
            TraceGroupMetadata {
                completed_steps: 2,
                active_steps: 0,
                total_steps: 2
            }
        );
        assert_eq!(store.trace(&second).unwrap().parent_span_trace, Some(first.trace_id));
    }

    #[test]
    fn ended_records_ignore_later_operations() {
        let store = TraceStore::default();
        let key = store.start_trace("t1", "a", StepType::Event, None);
        store.end_trace(&key, None);
        store.record(&key, state_op("set"));
        assert!(store.trace(&key).unwrap().spans.is_empty());
    }

    #[test]
    fn oldest_group_is_evicted_at_capacity() {
        let store = TraceStore::new(2);
        store.start_trace("g1", "a", StepType::Event, None);
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.start_trace("g2", "a", StepType::Event, None);
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.start_trace("g3", "a", StepType::Event, None);

        let ids: Vec<String> = store.groups().into_iter().map(|group| group.id).collect();
        assert_eq!(ids, vec!["g3", "g2"]);
        assert!(store.traces("g1").is_none());
    }

    #[test]
    fn discarded_records_leave_the_group() {
        let store = TraceStore::default();
        let key = store.start_trace("t1", "a", StepType::Event, None);
        store.discard_trace(&key);

        assert!(store.trace(&key).is_none());
        assert_eq!(store.group("t1").unwrap().metadata, TraceGroupMetadata::default());
    }
}
