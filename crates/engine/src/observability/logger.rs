//! Trace-scoped structured logging.
//!
//! A [`Logger`] is bound to one trace and ships each entry through a
//! [`LogSender`] without waiting. Inside a child runtime the sender is the
//! RPC session (a `log` notification to the host); on the host it is the
//! [`LogCollector`](super::LogCollector) itself.

use std::fmt;
use std::sync::Arc;

use polystep_rpc::RpcSession;
use polystep_types::{LogEntry, LogLevel, RpcMethod, TraceContext};
use serde_json::{Map, Value};
use tracing::debug;

/// Fire-and-forget delivery of log entries.
pub trait LogSender: Send + Sync {
    /// Hands `entry` off for delivery. Must not block and never fails the caller.
    fn send_no_wait(&self, method: RpcMethod, entry: LogEntry);
}

impl LogSender for RpcSession {
    fn send_no_wait(&self, method: RpcMethod, entry: LogEntry) {
        let args = match serde_json::to_value(&entry) {
            Ok(args) => args,
            Err(error) => {
                debug!(session = %self.name(), error = %error, "Dropping unserializable log entry");
                return;
            }
        };
        if let Err(error) = self.notify(method, args) {
            debug!(session = %self.name(), error = %error, "Dropping log entry");
        }
    }
}

/// Logger bound to `(traceId, flows, sender)`.
#[derive(Clone)]
pub struct Logger {
    trace: TraceContext,
    step: Option<String>,
    sender: Arc<dyn LogSender>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("trace", &self.trace)
            .field("step", &self.step)
            .finish()
    }
}

impl Logger {
    pub fn new(trace: TraceContext, sender: Arc<dyn LogSender>) -> Self {
        Self {
            trace,
            step: None,
            sender,
        }
    }

    /// Attributes every entry to `step`.
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// A new logger for a nested unit of work on the same trace.
    pub fn child(&self, step: impl Into<String>) -> Self {
        Self {
            trace: self.trace.clone(),
            step: Some(step.into()),
            sender: Arc::clone(&self.sender),
        }
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn step(&self) -> Option<&str> {
        self.step.as_deref()
    }

    pub fn debug(&self, msg: impl Into<String>, fields: Option<Value>) {
        self.log(LogLevel::Debug, msg, fields);
    }

    pub fn info(&self, msg: impl Into<String>, fields: Option<Value>) {
        self.log(LogLevel::Info, msg, fields);
    }

    pub fn warn(&self, msg: impl Into<String>, fields: Option<Value>) {
        self.log(LogLevel::Warn, msg, fields);
    }

    pub fn error(&self, msg: impl Into<String>, fields: Option<Value>) {
        self.log(LogLevel::Error, msg, fields);
    }

    /// Builds the entry and ships it as a `log` notification.
    ///
    /// Object fields are merged into the entry; any other value is kept
    /// under `args`.
    pub fn log(&self, level: LogLevel, msg: impl Into<String>, fields: Option<Value>) {
        let fields = fields.map(|fields| match fields {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("args".to_string(), other);
                map
            }
        });
        let mut entry = LogEntry::new(level, msg, &self.trace.trace_id, self.trace.flows.clone(), fields);
        if let Some(step) = &self.step {
            entry = entry.with_step(step.clone());
        }
        self.sender.send_no_wait(RpcMethod::Log, entry);
    }
}

/// Produces a fresh logger per invocation, all sharing one sender.
#[derive(Clone)]
pub struct LoggerFactory {
    sender: Arc<dyn LogSender>,
}

impl LoggerFactory {
    pub fn new(sender: Arc<dyn LogSender>) -> Self {
        Self { sender }
    }

    pub fn create(&self, trace: &TraceContext, step: Option<&str>) -> Logger {
        let logger = Logger::new(trace.clone(), Arc::clone(&self.sender));
        match step {
            Some(step) => logger.with_step(step),
            None => logger,
        }
    }
}
