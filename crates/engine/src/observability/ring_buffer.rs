//! Bounded buffer of collected log entries.

use polystep_types::{LogEntry, LogLevel};
use std::collections::VecDeque;

/// Keeps the newest `max_size` entries, dropping the oldest first.
#[derive(Debug, Clone)]
pub struct LogRingBuffer {
    buffer: VecDeque<LogEntry>,
    max_size: usize,
}

impl LogRingBuffer {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            buffer: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.buffer.len() >= self.max_size {
            self.buffer.pop_front();
        }
        self.buffer.push_back(entry);
    }

    /// The newest `count` entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        let start = self.buffer.len().saturating_sub(count);
        self.buffer.iter().skip(start).cloned().collect()
    }

    pub fn all(&self) -> Vec<LogEntry> {
        self.buffer.iter().cloned().collect()
    }

    pub fn by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.buffer.iter().filter(|entry| entry.level == level).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: LogLevel, msg: &str) -> LogEntry {
        LogEntry::new(level, msg, "t1", vec!["flow".to_string()], None)
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut buffer = LogRingBuffer::new(2);
        for i in 0..5 {
            buffer.push(entry(LogLevel::Info, &format!("Message {i}")));
        }

        assert_eq!(buffer.len(), 2);
        let recent = buffer.recent(10);
        assert_eq!(recent[0].msg, "Message 3");
        assert_eq!(recent[1].msg, "Message 4");
    }

    #[test]
    fn recent_returns_newest_tail_and_level_filter_works() {
        let mut buffer = LogRingBuffer::new(10);
        buffer.push(entry(LogLevel::Info, "a"));
        buffer.push(entry(LogLevel::Error, "b"));
        buffer.push(entry(LogLevel::Info, "c"));

        let tail: Vec<String> = buffer.recent(2).into_iter().map(|entry| entry.msg).collect();
        assert_eq!(tail, vec!["b", "c"]);
        assert_eq!(buffer.by_level(LogLevel::Error).len(), 1);

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
