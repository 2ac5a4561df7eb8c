use std::sync::{Arc, Mutex};
use std::time::Duration;
use svcwrap_core::{
    EventLogger, HookKind, HookSpec, LogHandler, ManagedProcess, ServiceConfig, SpawnRequest,
};
use tracing::{info, warn};

use super::controller::ProcessController;

/// Runs lifecycle hooks to completion and keeps track of the ones in flight
pub struct HookRunner {
    events: Arc<dyn EventLogger>,
    in_flight: Mutex<Vec<Arc<ManagedProcess>>>,
}

impl HookRunner {
    pub fn new(events: Arc<dyn EventLogger>) -> Self {
        Self {
            events,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Run the configured hook for `kind`, if any, and wait for it.
    ///
    /// Failures are reported as events and never abort the calling phase.
    /// Returns the hook's exit code when it ran.
    pub async fn run<F>(
        &self,
        controller: &ProcessController,
        config: &ServiceConfig,
        kind: HookKind,
        on_progress: F,
    ) -> Option<i32>
    where
        F: FnMut(),
    {
        let hook = config.hook(kind)?;
        let request = Self::request(config, hook);
        let (stdout_log, stderr_log) = LogHandler::append_to(
            hook.stdout_path.as_deref(),
            hook.stderr_path.as_deref(),
            self.events.clone(),
        );

        let process = match controller
            .start_with_outputs(request, stdout_log.as_ref(), stderr_log.as_ref(), None)
            .await
        {
            Ok(process) => Arc::new(process),
            Err(e) => {
                self.events
                    .error(&format!("Failed to start {kind} hook {}: {e}", hook.executable));
                return None;
            }
        };
        info!(hook = %kind, pid = %process.pid(), "Running hook");

        self.track(&process);
        let code = controller.wait_for_exit(&process, on_progress).await;
        self.untrack(&process);
        process.output_drained(Duration::from_secs(5)).await;

        if code == 0 {
            info!(hook = %kind, "Hook finished");
        } else {
            warn!(hook = %kind, code, "Hook exited with a failure code");
            self.events
                .warning(&format!("{kind} hook {} exited with code {code}", hook.executable));
        }
        Some(code)
    }

    /// Hook processes currently running
    pub fn in_flight(&self) -> Vec<Arc<ManagedProcess>> {
        self.lock().clone()
    }

    /// Stop every running hook together with its descendants
    pub async fn stop_all(&self, controller: &ProcessController, timeout: Duration) {
        for process in self.in_flight() {
            warn!(pid = %process.pid(), "Stopping running hook");
            controller.stop_tree(&process, timeout, true).await;
        }
    }

    fn request(config: &ServiceConfig, hook: &HookSpec) -> SpawnRequest {
        SpawnRequest::new(&hook.executable, &hook.arguments)
            .working_directory(config.working_directory.clone())
            .env(config.env.clone())
            .hide_window(config.hide_window)
    }

    fn track(&self, process: &Arc<ManagedProcess>) {
        self.lock().push(process.clone());
    }

    fn untrack(&self, process: &Arc<ManagedProcess>) {
        self.lock().retain(|p| p.pid() != process.pid());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<ManagedProcess>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}
