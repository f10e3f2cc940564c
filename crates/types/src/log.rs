//! Structured log entries shipped from steps to the collector.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Keys owned by the entry itself; caller fields never override them.
const RESERVED_KEYS: [&str; 6] = ["level", "msg", "time", "traceId", "flows", "step"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid log level: {0}")]
pub struct ParseLogLevelError(String);

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ParseLogLevelError(other.to_string())),
        }
    }
}

/// One structured log line attributed to a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub msg: String,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
    pub trace_id: String,
    #[serde(default)]
    pub flows: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogEntry {
    /// Builds an entry stamped with the current time.
    ///
    /// Caller fields are merged beneath the entry's own keys and any
    /// error-like `error` field is normalized.
    pub fn new(
        level: LogLevel,
        msg: impl Into<String>,
        trace_id: impl Into<String>,
        flows: Vec<String>,
        fields: Option<Map<String, Value>>,
    ) -> Self {
        let mut fields = fields.unwrap_or_default();
        for key in RESERVED_KEYS {
            fields.remove(key);
        }
        normalize_error_field(&mut fields);
        Self {
            level,
            msg: msg.into(),
            time: Utc::now().timestamp_millis(),
            trace_id: trace_id.into(),
            flows,
            step: None,
            fields,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Re-applies normalization to an entry that arrived from a child.
    pub fn normalized(mut self) -> Self {
        normalize_error_field(&mut self.fields);
        self
    }
}

/// Replaces an error-like `error` field with `{message, stack, name}`.
///
/// An object counts as error-like when it carries a string `message`. Other
/// values are left untouched.
pub fn normalize_error_field(fields: &mut Map<String, Value>) {
    let Some(Value::Object(error)) = fields.get("error") else {
        return;
    };
    let Some(message) = error.get("message").and_then(Value::as_str) else {
        return;
    };
    let normalized = json!({
        "message": message,
        "stack": error.get("stack").cloned().unwrap_or(Value::Null),
        "name": error
            .get("name")
            .cloned()
            .unwrap_or_else(|| Value::String("Error".to_string())),
    });
    fields.insert("error".to_string(), normalized);
}

/// Renders a Rust error as the error-like object carried in log fields.
///
/// The `stack` holds the `source()` chain, one cause per line.
pub fn error_object<E: std::error::Error + ?Sized>(error: &E) -> Value {
    let mut stack = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        stack.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    let name = std::any::type_name::<E>().rsplit("::").next().unwrap_or("Error");
    json!({
        "message": error.to_string(),
        "stack": stack.join("\n"),
        "name": name,
    })
}
