//! Per-invocation recording of state, emit and stream operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use polystep_types::StepType;
use serde_json::{Value, json};

use super::logger::Logger;
use super::trace_store::{SpanKind, SpanOperation, SpanRecord, TraceError, TraceKey, TraceStore};

/// Records what one step invocation did.
///
/// `end` is terminal: operations recorded afterwards are ignored. A child
/// tracer shares the trace id but owns its own span list, and ending it
/// leaves the parent running.
pub trait Tracer: Send + Sync {
    fn state_operation(&self, operation: &str, input: Value);

    fn emit_operation(&self, topic: &str, data: Value, success: bool);

    fn stream_operation(&self, stream_name: &str, operation: &str, input: Value);

    fn child(&self, step: &str) -> Arc<dyn Tracer>;

    /// Discards what was recorded without closing it.
    fn clear(&self);

    fn end(&self, error: Option<TraceError>);

    fn is_ended(&self) -> bool;
}

/// Tracer that writes into a [`TraceStore`].
pub struct RecordingTracer {
    store: Arc<TraceStore>,
    key: TraceKey,
    logger: Logger,
    ended: AtomicBool,
}

impl RecordingTracer {
    pub fn start(store: Arc<TraceStore>, group_id: &str, step: &str, entry_type: StepType, logger: Logger) -> Self {
        let key = store.start_trace(group_id, step, entry_type, None);
        Self {
            store,
            key,
            logger,
            ended: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &TraceKey {
        &self.key
    }

    fn record(&self, kind: SpanKind, name: Option<&str>, operation: &str, input: Value, success: Option<bool>) {
        if self.is_ended() {
            return;
        }
        self.store.record(
            &self.key,
            SpanRecord {
                kind,
                name: name.map(str::to_string),
                operation: SpanOperation {
                    operation: operation.to_string(),
                    input,
                    success,
                    timestamp: Utc::now().timestamp_millis(),
                },
            },
        );
    }
}

impl Tracer for RecordingTracer {
    fn state_operation(&self, operation: &str, input: Value) {
        self.record(SpanKind::State, None, operation, input, None);
    }

    fn emit_operation(&self, topic: &str, data: Value, success: bool) {
        self.record(SpanKind::Emit, Some(topic), "emit", data, Some(success));
    }

    fn stream_operation(&self, stream_name: &str, operation: &str, input: Value) {
        self.record(SpanKind::Stream, Some(stream_name), operation, input, None);
    }

    fn child(&self, step: &str) -> Arc<dyn Tracer> {
        let key = self
            .store
            .start_trace(&self.key.group_id, step, StepType::Event, Some(&self.key));
        Arc::new(RecordingTracer {
            store: Arc::clone(&self.store),
            key,
            logger: self.logger.child(step),
            ended: AtomicBool::new(false),
        })
    }

    fn clear(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.store.discard_trace(&self.key);
    }

    fn end(&self, error: Option<TraceError>) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let fields = error
            .as_ref()
            .map(|error| json!({"error": {"message": error.message, "stack": error.stack}}));
        self.store.end_trace(&self.key, error);
        self.logger.debug("Trace ended", fields);
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

/// Tracer used when tracing is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl NoopTracer {
    /// The shared instance; `child` hands this same instance back.
    pub fn shared() -> Arc<dyn Tracer> {
        static SHARED: OnceLock<Arc<NoopTracer>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(NoopTracer)).clone()
    }
}

impl Tracer for NoopTracer {
    fn state_operation(&self, _operation: &str, _input: Value) {}

    fn emit_operation(&self, _topic: &str, _data: Value, _success: bool) {}

    fn stream_operation(&self, _stream_name: &str, _operation: &str, _input: Value) {}

    fn child(&self, _step: &str) -> Arc<dyn Tracer> {
        NoopTracer::shared()
    }

    fn clear(&self) {}

    fn end(&self, _error: Option<TraceError>) {}

    fn is_ended(&self) -> bool {
        false
    }
}
