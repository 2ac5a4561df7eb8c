//! Administrator-facing event log.
//!
//! Events are coarse, one per lifecycle phase or housekeeping failure, and are
//! kept separate from the detailed `tracing` diagnostics.

use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

pub trait EventLogger: Send + Sync {
    fn log_event(&self, level: EventLevel, message: &str);

    fn info(&self, message: &str) {
        self.log_event(EventLevel::Info, message);
    }

    fn warning(&self, message: &str) {
        self.log_event(EventLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.log_event(EventLevel::Error, message);
    }
}

/// Forwards events to `tracing` under the `svcwrap::event` target
#[derive(Debug, Default, Clone)]
pub struct TracingEventLogger {
    service_id: String,
}

impl TracingEventLogger {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
        }
    }
}

impl EventLogger for TracingEventLogger {
    fn log_event(&self, level: EventLevel, message: &str) {
        let service = self.service_id.as_str();
        match level {
            EventLevel::Info => info!(target: "svcwrap::event", service, "{message}"),
            EventLevel::Warning => warn!(target: "svcwrap::event", service, "{message}"),
            EventLevel::Error => error!(target: "svcwrap::event", service, "{message}"),
        }
    }
}

/// Keeps events in memory; useful for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryEventLogger {
    events: Mutex<Vec<(EventLevel, String)>>,
}

impl MemoryEventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(EventLevel, String)> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|(_, message)| message.contains(needle))
    }
}

impl EventLogger for MemoryEventLogger {
    fn log_event(&self, level: EventLevel, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((level, message.to_string()));
    }
}
