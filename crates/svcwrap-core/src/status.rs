//! Pending-operation protocol towards the OS service manager.
//!
//! The reporter is the only writer of service status. While a start or stop is
//! pending the caller must call [`ServiceStatusReporter::signal_pending`] more
//! often than the wait hint, either directly between wait slices or through a
//! [`KeepAlive`] task.

use crate::error::{Result, WrapperError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
}

impl ServiceState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ServiceState::StartPending | ServiceState::StopPending)
    }
}

/// One status notification as seen by the service manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Zero outside pending states
    pub checkpoint: u32,
    pub wait_hint: Duration,
    pub exit_code: i32,
}

/// Delivers status notifications to the OS service manager
pub trait StatusSink: Send + Sync {
    fn set_status(&self, status: &ServiceStatus) -> anyhow::Result<()>;
}

/// Used where no service manager is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn set_status(&self, status: &ServiceStatus) -> anyhow::Result<()> {
        info!(
            state = ?status.state,
            checkpoint = status.checkpoint,
            wait_hint_ms = status.wait_hint.as_millis() as u64,
            exit_code = status.exit_code,
            "Service status"
        );
        Ok(())
    }
}

/// Keeps every notification; for embedding and tests
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    statuses: Mutex<Vec<ServiceStatus>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn states(&self) -> Vec<ServiceState> {
        self.statuses().iter().map(|s| s.state).collect()
    }
}

impl StatusSink for RecordingStatusSink {
    fn set_status(&self, status: &ServiceStatus) -> anyhow::Result<()> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(status.clone());
        Ok(())
    }
}

#[derive(Debug)]
struct ReporterState {
    state: ServiceState,
    checkpoint: u32,
}

pub struct ServiceStatusReporter {
    sink: Arc<dyn StatusSink>,
    wait_hint: Duration,
    inner: Mutex<ReporterState>,
}

impl ServiceStatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>, wait_hint: Duration) -> Self {
        Self {
            sink,
            wait_hint,
            inner: Mutex::new(ReporterState {
                state: ServiceState::Stopped,
                checkpoint: 0,
            }),
        }
    }

    pub fn wait_hint(&self) -> Duration {
        self.wait_hint
    }

    pub fn state(&self) -> ServiceState {
        self.lock().state
    }

    /// Highest checkpoint reported so far; never decreases
    pub fn checkpoint(&self) -> u32 {
        self.lock().checkpoint
    }

    /// Enter a start or stop pending state
    pub fn begin_pending(&self, state: ServiceState) -> Result<()> {
        if !state.is_pending() {
            return Err(WrapperError::InvalidState(format!(
                "{state:?} is not a pending state"
            )));
        }
        // Sink calls happen under the lock so checkpoints reach the manager in order
        let mut inner = self.lock();
        inner.state = state;
        inner.checkpoint += 1;
        self.send(&self.status(state, inner.checkpoint, 0))
    }

    /// Prove progress of the current pending operation
    pub fn signal_pending(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.is_pending() {
            debug!(state = ?inner.state, "Ignoring progress signal outside a pending state");
            return Ok(());
        }
        inner.checkpoint += 1;
        self.send(&self.status(inner.state, inner.checkpoint, 0))
    }

    pub fn signal_running(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.state = ServiceState::Running;
        self.send(&self.status(ServiceState::Running, 0, 0))
    }

    pub fn signal_stopped(&self, exit_code: i32) -> Result<()> {
        let mut inner = self.lock();
        inner.state = ServiceState::Stopped;
        self.send(&self.status(ServiceState::Stopped, 0, exit_code))
    }

    /// Signal progress every `interval` until the returned guard is dropped
    pub fn keep_alive(self: &Arc<Self>, interval: Duration) -> KeepAlive {
        let token = CancellationToken::new();
        let stop = token.clone();
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = reporter.signal_pending() {
                            debug!(error = %e, "Progress signal failed");
                        }
                    }
                }
            }
        });
        KeepAlive {
            _guard: token.drop_guard(),
        }
    }

    fn status(&self, state: ServiceState, checkpoint: u32, exit_code: i32) -> ServiceStatus {
        ServiceStatus {
            state,
            checkpoint: if state.is_pending() { checkpoint } else { 0 },
            wait_hint: if state.is_pending() {
                self.wait_hint
            } else {
                Duration::ZERO
            },
            exit_code,
        }
    }

    fn send(&self, status: &ServiceStatus) -> Result<()> {
        self.sink
            .set_status(status)
            .map_err(|e| WrapperError::Status(format!("{e:#}")))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReporterState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Stops the background progress signal when dropped
#[must_use = "progress signalling stops when the guard is dropped"]
pub struct KeepAlive {
    _guard: DropGuard,
}
