use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Unique identifier for a process
pub type ProcessId = u32;

/// Scheduling priority requested for a spawned process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessPriority {
    Idle,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
    RealTime,
}

impl ProcessPriority {
    /// Unix nice value for this priority
    pub fn nice_value(&self) -> i32 {
        match self {
            ProcessPriority::Idle => 19,
            ProcessPriority::BelowNormal => 10,
            ProcessPriority::Normal => 0,
            ProcessPriority::AboveNormal => -5,
            ProcessPriority::High => -10,
            ProcessPriority::RealTime => -20,
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully signalled or terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation timed out
    Timeout,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Already-exited processes count as a successful termination
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Everything needed to spawn one process
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub executable: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub hide_window: bool,
    pub priority: ProcessPriority,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
}

impl SpawnRequest {
    pub fn new<S: ToString, I: IntoIterator<Item = S>>(executable: impl Into<String>, args: I) -> Self {
        Self {
            executable: executable.into(),
            arguments: args.into_iter().map(|s| s.to_string()).collect(),
            working_directory: None,
            env: HashMap::new(),
            hide_window: false,
            priority: ProcessPriority::Normal,
            capture_stdout: false,
            capture_stderr: false,
        }
    }

    pub fn working_directory(mut self, dir: Option<PathBuf>) -> Self {
        self.working_directory = dir;
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn hide_window(mut self, hide: bool) -> Self {
        self.hide_window = hide;
        self
    }

    pub fn priority(mut self, priority: ProcessPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn capture(mut self, stdout: bool, stderr: bool) -> Self {
        self.capture_stdout = stdout;
        self.capture_stderr = stderr;
        self
    }

    /// Platform-independent part of the command; platform managers add the rest
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.arguments);

        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(if self.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if self.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd
    }
}

/// Core trait for spawning processes
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn a new process as described by the request
    async fn spawn_process(&self, request: &SpawnRequest) -> std::io::Result<Child>;

    /// Apply a scheduling priority; a process that already exited is not an error
    async fn set_priority(&self, pid: ProcessId, priority: ProcessPriority) -> Result<()>;
}

/// Trait for terminating single processes by id
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask a process to exit (SIGTERM on Unix)
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult;

    /// Force kill a process (SIGKILL on Unix)
    async fn force_kill(&self, pid: ProcessId) -> TerminationResult;

    /// Process group `pid` belongs to, on platforms that have them.
    ///
    /// Group members stay reachable after their parent exited and they were
    /// re-parented.
    fn process_group(&self, _pid: ProcessId) -> Option<ProcessId> {
        None
    }
}

/// High-level process manager trait that combines lifecycle and termination
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Get the platform name for logging and debugging
    fn platform_name(&self) -> &'static str;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// Create a new process manager instance for the current platform
    fn create_process_manager() -> Arc<dyn ProcessManager>;

    /// Get the platform name
    fn platform_name() -> &'static str;
}

/// Invoked once with the pid and exit code when a watched process exits
pub type ExitCallback = Box<dyn FnOnce(ProcessId, i32) + Send + 'static>;

/// One spawned OS process, observed by a dedicated exit watcher
#[derive(Debug)]
pub struct ManagedProcess {
    pid: ProcessId,
    command: String,
    args: Vec<String>,
    started_at: DateTime<Local>,
    stdout_redirected: bool,
    stderr_redirected: bool,
    exit: watch::Receiver<Option<i32>>,
    descendants: Mutex<BTreeSet<ProcessId>>,
    output_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagedProcess {
    /// Take ownership of a spawned child and watch it until it exits.
    ///
    /// The child's stdout/stderr must already have been taken by the caller.
    pub fn watch(mut child: Child, request: &SpawnRequest, on_exit: Option<ExitCallback>) -> std::io::Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("spawned process has no pid"))?;
        let (tx, rx) = watch::channel(None);

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(pid = %pid, error = %e, "Failed to wait for process");
                    -1
                }
            };
            debug!(pid = %pid, code, "Process exited");
            let _ = tx.send(Some(code));
            if let Some(callback) = on_exit {
                callback(pid, code);
            }
        });

        Ok(Self {
            pid,
            command: request.executable.clone(),
            args: request.arguments.clone(),
            started_at: Local::now(),
            stdout_redirected: request.capture_stdout,
            stderr_redirected: request.capture_stderr,
            exit: rx,
            descendants: Mutex::new(BTreeSet::new()),
            output_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn stdout_redirected(&self) -> bool {
        self.stdout_redirected
    }

    pub fn stderr_redirected(&self) -> bool {
        self.stderr_redirected
    }

    /// Exit code once the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit.clone();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return code;
            }
            if rx.changed().await.is_err() {
                // Watcher gone: report whatever it published last
                return rx.borrow().unwrap_or(-1);
            }
        }
    }

    /// Wait at most `timeout` for the process to exit
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Record descendants discovered while stopping this process
    pub fn record_descendants(&self, pids: &[ProcessId]) {
        let mut known = self.descendants.lock().unwrap_or_else(|e| e.into_inner());
        known.extend(pids.iter().copied());
    }

    pub fn known_descendants(&self) -> Vec<ProcessId> {
        let known = self.descendants.lock().unwrap_or_else(|e| e.into_inner());
        known.iter().copied().collect()
    }

    /// Keep the copy loops serving this process's output pipes
    pub fn track_output(&self, handles: Vec<JoinHandle<()>>) {
        let mut tasks = self.output_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.extend(handles);
    }

    /// Wait until every output copy loop reached end of stream.
    ///
    /// Returns false when `timeout` elapsed first; the loops keep running.
    pub async fn output_drained(&self, timeout: Duration) -> bool {
        let handles: Vec<_> = {
            let mut tasks = self.output_tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        let deadline = tokio::time::Instant::now() + timeout;
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                return false;
            }
        }
        true
    }
}

/// Map an exit status to a single exit code
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_result_is_ok() {
        assert!(TerminationResult::Success.is_ok());
        assert!(TerminationResult::ProcessNotFound.is_ok());
        assert!(!TerminationResult::AccessDenied.is_ok());
        assert!(!TerminationResult::Failed("x".to_string()).is_ok());
    }

    #[test]
    fn test_priority_nice_values_are_ordered() {
        let order = [
            ProcessPriority::RealTime,
            ProcessPriority::High,
            ProcessPriority::AboveNormal,
            ProcessPriority::Normal,
            ProcessPriority::BelowNormal,
            ProcessPriority::Idle,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].nice_value() < pair[1].nice_value());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watch_reports_exit_code_and_callback() {
        let request = SpawnRequest::new("sh", ["-c", "exit 7"]);
        let child = request.command().spawn().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let process = ManagedProcess::watch(
            child,
            &request,
            Some(Box::new(move |pid, code| {
                let _ = tx.send((pid, code));
            })),
        )
        .unwrap();

        assert_eq!(process.wait().await, 7);
        assert_eq!(process.exit_code(), Some(7));
        let (pid, code) = rx.await.unwrap();
        assert_eq!(pid, process.pid());
        assert_eq!(code, 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_timeout_returns_none_while_running() {
        let request = SpawnRequest::new("sleep", ["2"]);
        let child = request.command().spawn().unwrap();
        let process = ManagedProcess::watch(child, &request, None).unwrap();
        assert_eq!(process.wait_timeout(Duration::from_millis(100)).await, None);
        assert!(!process.has_exited());
        assert_eq!(process.wait().await, 0);
    }

    #[test]
    fn test_command_discards_uncaptured_streams() {
        let request = SpawnRequest::new("echo", ["hi"]).capture(true, false);
        assert!(request.capture_stdout);
        assert!(!request.capture_stderr);
        let _ = request.command();
    }
}
