//! Host-side sink for `log` notifications from every session.

use std::sync::Mutex;

use indexmap::IndexMap;
use polystep_rpc::RpcError;
use polystep_types::{LogEntry, LogLevel, RpcMethod};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::formatter::LogFormatter;
use super::logger::LogSender;
use super::ring_buffer::LogRingBuffer;

pub const DEFAULT_MAX_ENTRIES: usize = 5000;
pub const DEFAULT_MAX_ENTRIES_PER_TRACE: usize = 1000;
const DEFAULT_MAX_TRACES: usize = 200;
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug)]
struct Buffers {
    global: LogRingBuffer,
    per_trace: IndexMap<String, LogRingBuffer>,
}

/// Collects, buffers and fans out structured log entries.
#[derive(Debug)]
pub struct LogCollector {
    buffers: Mutex<Buffers>,
    per_trace_capacity: usize,
    max_traces: usize,
    events: broadcast::Sender<LogEntry>,
    formatter: LogFormatter,
    verbose: bool,
}

impl LogCollector {
    pub fn new(max_entries: usize, verbose: bool) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            buffers: Mutex::new(Buffers {
                global: LogRingBuffer::new(max_entries),
                per_trace: IndexMap::new(),
            }),
            per_trace_capacity: DEFAULT_MAX_ENTRIES_PER_TRACE.min(max_entries.max(1)),
            max_traces: DEFAULT_MAX_TRACES,
            events,
            formatter: LogFormatter::new(),
            verbose,
        }
    }

    /// Stores an entry, mirrors it when verbose and notifies subscribers.
    pub fn record(&self, entry: LogEntry) {
        let entry = entry.normalized();
        if self.verbose {
            self.mirror(&entry);
        }
        {
            let mut buffers = self.lock();
            buffers.global.push(entry.clone());
            if !buffers.per_trace.contains_key(&entry.trace_id) && buffers.per_trace.len() >= self.max_traces {
                buffers.per_trace.shift_remove_index(0);
            }
            buffers
                .per_trace
                .entry(entry.trace_id.clone())
                .or_insert_with(|| LogRingBuffer::new(self.per_trace_capacity))
                .push(entry.clone());
        }
        let _ = self.events.send(entry);
    }

    /// Handler body for inbound `log` notifications.
    pub fn record_raw(&self, args: Value) -> Result<(), RpcError> {
        let entry: LogEntry = serde_json::from_value(args)?;
        self.record(entry);
        Ok(())
    }

    /// The newest `limit` entries across all traces.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.lock().global.recent(limit)
    }

    /// The newest `limit` entries of one trace.
    pub fn for_trace(&self, trace_id: &str, limit: usize) -> Vec<LogEntry> {
        self.lock()
            .per_trace
            .get(trace_id)
            .map(|buffer| buffer.recent(limit))
            .unwrap_or_default()
    }

    pub fn by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.lock().global.by_level(level)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.events.subscribe()
    }

    pub fn clear(&self) {
        let mut buffers = self.lock();
        buffers.global.clear();
        buffers.per_trace.clear();
    }

    /// Display line with secrets redacted.
    pub fn render(&self, entry: &LogEntry) -> String {
        self.formatter.format(entry)
    }

    pub fn formatter(&self) -> &LogFormatter {
        &self.formatter
    }

    fn mirror(&self, entry: &LogEntry) {
        let line = self.formatter.format(entry);
        let step = entry.step.as_deref().unwrap_or("engine");
        match entry.level {
            LogLevel::Debug => debug!(target: "polystep::step", trace_id = %entry.trace_id, step, "{line}"),
            LogLevel::Info => info!(target: "polystep::step", trace_id = %entry.trace_id, step, "{line}"),
            LogLevel::Warn => warn!(target: "polystep::step", trace_id = %entry.trace_id, step, "{line}"),
            LogLevel::Error => error!(target: "polystep::step", trace_id = %entry.trace_id, step, "{line}"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LogCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, false)
    }
}

impl LogSender for LogCollector {
    fn send_no_wait(&self, _method: RpcMethod, entry: LogEntry) {
        self.record(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::Logger;
    use polystep_types::TraceContext;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn entries_are_indexed_per_trace() {
        let collector = Arc::new(LogCollector::default());
        let first = Logger::new(TraceContext::new("t1", vec![]), collector.clone());
        let second = Logger::new(TraceContext::new("t2", vec![]), collector.clone());

        first.info("one", None);
        second.info("two", None);
        first.error("three", None);

        assert_eq!(collector.recent(10).len(), 3);
        let t1: Vec<String> = collector.for_trace("t1", 10).into_iter().map(|entry| entry.msg).collect();
        assert_eq!(t1, vec!["one", "three"]);
        assert_eq!(collector.by_level(LogLevel::Error).len(), 1);
        assert!(collector.for_trace("missing", 10).is_empty());
    }

    #[test]
    fn raw_notifications_are_normalized() {
        let collector = LogCollector::default();
        collector
            .record_raw(json!({
                "level": "error",
                "msg": "Payment failed",
                "time": 1_700_000_000_000i64,
                "traceId": "t9",
                "flows": ["checkout"],
                "error": {"message": "card declined", "stack": "at pay()"}
            }))
            .unwrap();

        let entry = &collector.for_trace("t9", 1)[0];
        assert_eq!(
            entry.fields["error"],
            json!({"message": "card declined", "stack": "at pay()", "name": "Error"})
        );
        assert!(collector.record_raw(json!({"msg": "no level"})).is_err());
    }

    #[tokio::test]
    async fn subscribers_see_new_entries() {
        let collector = Arc::new(LogCollector::default());
        let mut events = collector.subscribe();
        Logger::new(TraceContext::new("t1", vec![]), collector.clone()).info("hello", None);

        let entry = events.recv().await.unwrap();
        assert_eq!(entry.msg, "hello");
    }

    #[test]
    fn global_buffer_is_bounded() {
        let collector = Arc::new(LogCollector::new(3, false));
        let logger = Logger::new(TraceContext::new("t1", vec![]), collector.clone());
        for i in 0..5 {
            logger.info(format!("m{i}"), None);
        }

        let kept: Vec<String> = collector.recent(10).into_iter().map(|entry| entry.msg).collect();
        assert_eq!(kept, vec!["m2", "m3", "m4"]);
        assert_eq!(collector.for_trace("t1", 10).len(), 3);
    }
}
