//! Bounded per-connection log buffer.
//!
//! Backs `EnableConnectionLogs` / `RetrieveConnectionLogs` /
//! `ResetConnectionLogs`. Recording is muted until explicitly enabled;
//! the buffer keeps the most recent entries up to its capacity.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Source,
    Target,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct ConnectionLogger {
    capacity: usize,
    enabled: AtomicBool,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl ConnectionLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            enabled: AtomicBool::new(false),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.entries.lock().clear();
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn record(
        &self,
        category: LogCategory,
        level: LogLevel,
        address: Option<&str>,
        correlation_id: Option<&str>,
        message: impl Into<String>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let entry = LogEntry {
            timestamp: Utc::now(),
            category,
            level,
            address: address.map(str::to_string),
            correlation_id: correlation_id.map(str::to_string),
            message: message.into(),
        };
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn success(&self, category: LogCategory, address: Option<&str>, message: impl Into<String>) {
        self.record(category, LogLevel::Success, address, None, message);
    }

    pub fn failure(&self, category: LogCategory, address: Option<&str>, message: impl Into<String>) {
        self.record(category, LogLevel::Failure, address, None, message);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_muted_until_enabled() {
        let logger = ConnectionLogger::new(10);
        logger.success(LogCategory::Target, Some("telemetry"), "published");
        assert!(logger.entries().is_empty());

        logger.enable();
        logger.success(LogCategory::Target, Some("telemetry"), "published");
        assert_eq!(logger.entries().len(), 1);

        logger.reset();
        assert!(logger.entries().is_empty());
        assert!(!logger.is_enabled());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let logger = ConnectionLogger::new(2);
        logger.enable();
        logger.success(LogCategory::Source, None, "one");
        logger.success(LogCategory::Source, None, "two");
        logger.success(LogCategory::Source, None, "three");
        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "two");
        assert_eq!(entries[1].message, "three");
    }
}
