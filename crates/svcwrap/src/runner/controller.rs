use std::sync::Arc;
use std::time::Duration;
use svcwrap_core::{
    EventLogger, ExitCallback, LogHandler, ManagedProcess, ProcessId, ProcessManager,
    ProcessPriority, ProcessTable, Result, SpawnRequest, TerminationResult, WrapperError,
};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catch::Recover;

/// How long to wait for a force-killed process to disappear
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);
const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Outcome of stopping a process tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    /// Exit code of the root, when it was observed
    pub exit_code: Option<i32>,
    /// Processes that ignored the graceful request and were killed
    pub force_killed: Vec<ProcessId>,
    /// Processes still present after the final kill
    pub survivors: Vec<ProcessId>,
}

/// Starts processes with redirected output and stops whole process trees
pub struct ProcessController {
    manager: Arc<dyn ProcessManager>,
    table: ProcessTable,
    events: Arc<dyn EventLogger>,
    sleep_time: Duration,
}

impl ProcessController {
    pub fn new(manager: Arc<dyn ProcessManager>, events: Arc<dyn EventLogger>) -> Self {
        Self {
            manager,
            table: ProcessTable::new(),
            events,
            sleep_time: Duration::from_secs(1),
        }
    }

    /// Length of one wait slice in [`Self::wait_for_exit`]
    pub fn with_sleep_time(mut self, sleep_time: Duration) -> Self {
        self.sleep_time = sleep_time;
        self
    }

    pub fn manager(&self) -> &Arc<dyn ProcessManager> {
        &self.manager
    }

    /// Spawn `request`, wire its output into `log` and start watching it.
    ///
    /// A priority other than normal is applied after spawning; failing to apply
    /// it is reported but the process keeps running.
    pub async fn start(
        &self,
        request: SpawnRequest,
        log: Option<&LogHandler>,
        on_exit: Option<ExitCallback>,
    ) -> Result<ManagedProcess> {
        self.start_with_outputs(request, log, log, on_exit).await
    }

    /// Like [`Self::start`], with a separate handler per output stream
    pub async fn start_with_outputs(
        &self,
        request: SpawnRequest,
        stdout_log: Option<&LogHandler>,
        stderr_log: Option<&LogHandler>,
        on_exit: Option<ExitCallback>,
    ) -> Result<ManagedProcess> {
        let request = request.capture(
            stdout_log.is_some_and(LogHandler::captures_stdout),
            stderr_log.is_some_and(LogHandler::captures_stderr),
        );

        let mut child = self
            .manager
            .spawn_process(&request)
            .await
            .map_err(|e| WrapperError::spawn(format!("{}: {e}", request.executable)))?;

        let mut handles = Vec::new();
        if let (Some(handler), Some(stdout)) = (stdout_log, child.stdout.take()) {
            handles.extend(handler.attach(Some(stdout), None::<ChildStderr>));
        }
        if let (Some(handler), Some(stderr)) = (stderr_log, child.stderr.take()) {
            handles.extend(handler.attach(None::<ChildStdout>, Some(stderr)));
        }

        let process = ManagedProcess::watch(child, &request, on_exit)?;
        process.track_output(handles);

        if request.priority != ProcessPriority::Normal {
            self.manager
                .set_priority(process.pid(), request.priority)
                .await
                .recover(self.events.as_ref(), "Failed to set process priority");
        }

        info!(
            pid = %process.pid(),
            command = %process.command(),
            "Process started"
        );
        Ok(process)
    }

    /// Wait for `process` to exit, calling `on_progress` after every slice
    pub async fn wait_for_exit<F>(&self, process: &ManagedProcess, mut on_progress: F) -> i32
    where
        F: FnMut(),
    {
        loop {
            if let Some(code) = process.wait_timeout(self.sleep_time).await {
                return code;
            }
            on_progress();
        }
    }

    /// Stop every descendant of `process`, leaving the process itself alone.
    ///
    /// Used once the root already exited. Descendants recorded earlier and
    /// re-parented members of the root's process group are included.
    pub async fn stop_descendants(&self, process: &ManagedProcess, timeout: Duration) -> StopOutcome {
        let mut pids = self.table.descendants(process.pid());
        merge(&mut pids, process.known_descendants());
        merge(&mut pids, self.group_members(process));
        process.record_descendants(&pids);

        let (force_killed, survivors) = self.stop_all(&pids, timeout).await;
        StopOutcome {
            exit_code: process.exit_code(),
            force_killed,
            survivors,
        }
    }

    /// Stop `process` and all of its descendants.
    ///
    /// Descendants are enumerated before anything is signalled. Each stage asks
    /// gracefully, waits up to `timeout`, then kills.
    pub async fn stop_tree(
        &self,
        process: &ManagedProcess,
        timeout: Duration,
        parent_first: bool,
    ) -> StopOutcome {
        let mut descendants = self.table.descendants(process.pid());
        merge(&mut descendants, self.group_members(process));
        process.record_descendants(&descendants);
        debug!(pid = %process.pid(), descendants = ?descendants, "Stopping process tree");

        let mut outcome = StopOutcome {
            exit_code: None,
            force_killed: Vec::new(),
            survivors: Vec::new(),
        };

        if parent_first {
            let root_killed = self.stop_root(process, timeout).await;
            let (killed, survivors) = self.stop_all(&descendants, timeout).await;
            outcome.force_killed.extend(root_killed);
            outcome.force_killed.extend(killed);
            outcome.survivors = survivors;
        } else {
            let (killed, survivors) = self.stop_all(&descendants, timeout).await;
            let root_killed = self.stop_root(process, timeout).await;
            outcome.force_killed.extend(killed);
            outcome.force_killed.extend(root_killed);
            outcome.survivors = survivors;
        }

        // Forked while the tree was being stopped
        let stragglers: Vec<_> = self
            .group_members(process)
            .into_iter()
            .filter(|pid| !outcome.survivors.contains(pid))
            .collect();
        if !stragglers.is_empty() {
            debug!(pid = %process.pid(), stragglers = ?stragglers, "Stopping late group members");
            process.record_descendants(&stragglers);
            let (killed, survivors) = self.stop_all(&stragglers, timeout).await;
            outcome.force_killed.extend(killed);
            outcome.survivors.extend(survivors);
        }

        outcome.exit_code = process.exit_code();
        if outcome.exit_code.is_none() {
            outcome.survivors.push(process.pid());
        }
        if !outcome.survivors.is_empty() {
            self.events.warning(&format!(
                "Processes still running after forced termination: {:?}",
                outcome.survivors
            ));
        }
        outcome
    }

    /// Live members of the process group led by `process`, the leader excluded
    fn group_members(&self, process: &ManagedProcess) -> Vec<ProcessId> {
        let leader = process.pid();
        self.table.live_matching(|pid| {
            pid != leader && self.manager.process_group(pid) == Some(leader)
        })
    }

    /// Graceful request, bounded wait, then kill; returns the pid when killed
    async fn stop_root(&self, process: &ManagedProcess, timeout: Duration) -> Option<ProcessId> {
        let pid = process.pid();
        if process.has_exited() {
            return None;
        }

        self.request_stop(pid).await;
        if process.wait_timeout(timeout).await.is_some() {
            return None;
        }

        warn!(pid = %pid, "Process did not stop in time, killing it");
        self.events
            .warning(&format!("Process {pid} did not stop within {timeout:?}, killing it"));
        self.kill(pid).await;
        if process.wait_timeout(KILL_CONFIRM_TIMEOUT).await.is_none() {
            warn!(pid = %pid, "Process still present after kill");
        }
        Some(pid)
    }

    /// Stop a set of processes together; returns (killed, survivors)
    async fn stop_all(&self, pids: &[ProcessId], timeout: Duration) -> (Vec<ProcessId>, Vec<ProcessId>) {
        if pids.is_empty() {
            return (Vec::new(), Vec::new());
        }

        for pid in pids {
            self.request_stop(*pid).await;
        }

        let stubborn = self.wait_until_gone(pids, timeout).await;
        if stubborn.is_empty() {
            return (Vec::new(), Vec::new());
        }

        warn!(pids = ?stubborn, "Descendants did not stop in time, killing them");
        for pid in &stubborn {
            self.kill(*pid).await;
        }
        let survivors = self.wait_until_gone(&stubborn, KILL_CONFIRM_TIMEOUT).await;
        (stubborn, survivors)
    }

    /// Poll until none of `pids` is alive or `timeout` elapses; returns the live ones
    async fn wait_until_gone(&self, pids: &[ProcessId], timeout: Duration) -> Vec<ProcessId> {
        let deadline = Instant::now() + timeout;
        loop {
            let alive = self.table.alive_among(pids);
            if alive.is_empty() || Instant::now() >= deadline {
                return alive;
            }
            tokio::time::sleep(LIVENESS_POLL.min(deadline - Instant::now())).await;
        }
    }

    async fn request_stop(&self, pid: ProcessId) {
        match self.manager.terminate_gracefully(pid).await {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
            TerminationResult::AccessDenied => {
                self.events
                    .warning(&format!("Access denied when stopping process {pid}"));
            }
            other => {
                self.events
                    .warning(&format!("Failed to stop process {pid}: {other:?}"));
            }
        }
    }

    async fn kill(&self, pid: ProcessId) {
        match self.manager.force_kill(pid).await {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
            other => {
                self.events
                    .warning(&format!("Failed to kill process {pid}: {other:?}"));
            }
        }
    }
}

fn merge(pids: &mut Vec<ProcessId>, more: impl IntoIterator<Item = ProcessId>) {
    for pid in more {
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }
}
