//! Text rendering of collected log entries.

use chrono::{DateTime, Utc};
use polystep_types::LogEntry;
use polystep_util::redact_sensitive_with;

/// Renders entries as single lines, redacting secrets for display.
#[derive(Debug, Clone)]
pub struct LogFormatter {
    replacement: String,
}

impl LogFormatter {
    pub fn new() -> Self {
        Self {
            replacement: "[REDACTED]".to_string(),
        }
    }

    pub fn with_replacement(replacement: impl Into<String>) -> Self {
        Self {
            replacement: replacement.into(),
        }
    }

    /// Display form: short timestamp, secrets redacted.
    pub fn format(&self, entry: &LogEntry) -> String {
        let line = render(entry, "%H:%M:%S");
        redact_sensitive_with(&line, &self.replacement)
    }

    /// Export form: full timestamp, no redaction.
    pub fn format_for_export(&self, entry: &LogEntry) -> String {
        render(entry, "%Y-%m-%d %H:%M:%S%.3f UTC")
    }
}

impl Default for LogFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn render(entry: &LogEntry, time_format: &str) -> String {
    let timestamp = DateTime::<Utc>::from_timestamp_millis(entry.time)
        .map(|time| time.format(time_format).to_string())
        .unwrap_or_else(|| entry.time.to_string());
    let source = entry.step.as_deref().unwrap_or("engine");
    let mut line = format!("[{timestamp}] {} {source} ({}): {}", entry.level, entry.trace_id, entry.msg);
    if !entry.fields.is_empty() {
        let fields = entry
            .fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        line.push(' ');
        line.push_str(&fields);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystep_types::LogLevel;
    use serde_json::json;

    fn entry() -> LogEntry {
        let fields = json!({"orderId": "o1"}).as_object().cloned();
        LogEntry::new(LogLevel::Info, "Order placed with token: abc123", "t1", vec![], fields)
            .with_step("process-food-order")
    }

    #[test]
    fn display_lines_are_redacted() {
        let line = LogFormatter::new().format(&entry());
        assert!(line.contains("info process-food-order (t1)"));
        assert!(line.contains("token: [REDACTED]"));
        assert!(line.contains("orderId=\"o1\""));
    }

    #[test]
    fn export_lines_keep_the_raw_text() {
        let line = LogFormatter::new().format_for_export(&entry());
        assert!(line.contains("token: abc123"));
        assert!(line.contains("UTC]"));
    }
}
