use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;

pub const BRIDGE_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeLogEntry {
    pub timestamp: DateTime<Local>,
    pub severity: LogSeverity,
    pub message: String,
}

/// Operator-facing ring of the most recent bridge transitions.
/// Every entry is mirrored to the diagnostic log.
pub struct BridgeLog {
    entries: watch::Sender<Arc<VecDeque<BridgeLogEntry>>>,
}

impl BridgeLog {
    pub fn new() -> Self {
        let (entries, _) = watch::channel(Arc::new(VecDeque::with_capacity(BRIDGE_LOG_CAPACITY)));
        Self { entries }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogSeverity::Info, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.append(LogSeverity::Warning, message.into());
    }

    fn append(&self, severity: LogSeverity, message: String) {
        match severity {
            LogSeverity::Info => info!("[bridge] {}", message),
            LogSeverity::Warning => warn!("[bridge] {}", message),
        }
        let entry = BridgeLogEntry {
            timestamp: Local::now(),
            severity,
            message,
        };
        self.entries.send_modify(|entries| {
            let entries = Arc::make_mut(entries);
            entries.push_back(entry);
            while entries.len() > BRIDGE_LOG_CAPACITY {
                entries.pop_front();
            }
        });
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<BridgeLogEntry> {
        self.entries.borrow().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<VecDeque<BridgeLogEntry>>> {
        self.entries.subscribe()
    }

    pub fn clear_logs(&self) {
        self.entries.send_if_modified(|entries| {
            if entries.is_empty() {
                return false;
            }
            *entries = Arc::new(VecDeque::with_capacity(BRIDGE_LOG_CAPACITY));
            true
        });
    }
}

impl Default for BridgeLog {
    fn default() -> Self {
        Self::new()
    }
}
