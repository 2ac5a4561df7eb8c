use anyhow::Result;
use async_trait::async_trait;
use svcwrap_core::{
    ProcessId, ProcessLifecycle, ProcessManager, ProcessPriority, ProcessTermination,
    SpawnRequest, TerminationResult,
};
use tokio::process::Child;

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::{self, Pid as NixPid};
    use tracing::{debug, info, warn};

    /// Unix process manager: own process group per child, signals per pid
    #[derive(Debug, Default)]
    pub struct UnixProcessManager;

    impl UnixProcessManager {
        pub fn new() -> Self {
            Self
        }

        fn send(pid: ProcessId, sig: Signal) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid as i32);
            match signal::kill(nix_pid, sig) {
                Ok(()) => {
                    info!(pid = %pid, signal = %sig, "Sent signal to process");
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => {
                    debug!(pid = %pid, "Process not found (already terminated)");
                    TerminationResult::ProcessNotFound
                }
                Err(Errno::EPERM) => {
                    warn!(pid = %pid, signal = %sig, "Permission denied to signal process");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!(pid = %pid, signal = %sig, error = %e, "Failed to signal process");
                    TerminationResult::Failed(format!("{sig} failed: {e}"))
                }
            }
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        async fn spawn_process(&self, request: &SpawnRequest) -> std::io::Result<Child> {
            let mut cmd = request.command();

            // New process group so terminal signals aimed at the wrapper skip the child
            cmd.process_group(0);

            let child = cmd.spawn()?;
            if let Some(pid) = child.id() {
                info!(
                    pid = %pid,
                    command = %request.executable,
                    args = ?request.arguments,
                    "Spawned Unix process"
                );
            }
            Ok(child)
        }

        async fn set_priority(&self, pid: ProcessId, priority: ProcessPriority) -> Result<()> {
            let nice = priority.nice_value();
            // SAFETY: setpriority only reads its scalar arguments
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as libc::id_t, nice) };
            if rc == 0 {
                debug!(pid = %pid, nice, "Process priority set");
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!(pid = %pid, "Process exited before its priority could be set");
                return Ok(());
            }
            Err(anyhow::anyhow!("setpriority({pid}, {nice}) failed: {err}"))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
            Self::send(pid, Signal::SIGTERM)
        }

        async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
            Self::send(pid, Signal::SIGKILL)
        }

        fn process_group(&self, pid: ProcessId) -> Option<ProcessId> {
            unistd::getpgid(Some(NixPid::from_raw(pid as i32)))
                .ok()
                .map(|pgid| pgid.as_raw() as ProcessId)
        }
    }

    impl ProcessManager for UnixProcessManager {
        fn platform_name(&self) -> &'static str {
            "Unix"
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::UnixProcessManager;

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
#[derive(Debug, Default)]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let manager = UnixProcessManager::new();
        let request = SpawnRequest::new("sleep", ["30"]);
        let mut child = manager.spawn_process(&request).await.unwrap();
        let pid = child.id().unwrap();

        assert_eq!(manager.terminate_gracefully(pid).await, TerminationResult::Success);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());

        assert_eq!(manager.force_kill(pid).await, TerminationResult::ProcessNotFound);
    }

    #[tokio::test]
    async fn test_child_leads_its_own_process_group() {
        let manager = UnixProcessManager::new();
        let request = SpawnRequest::new("sleep", ["5"]);
        let mut child = manager.spawn_process(&request).await.unwrap();
        let pid = child.id().unwrap();

        assert_eq!(manager.process_group(pid), Some(pid));
        assert_ne!(manager.process_group(std::process::id()), Some(pid));

        child.kill().await.unwrap();
        child.wait().await.unwrap();
        assert_eq!(manager.process_group(pid), None);
    }

    #[tokio::test]
    async fn test_priority_tolerates_exited_process() {
        let manager = UnixProcessManager::new();
        let request = SpawnRequest::new("true", Vec::<String>::new());
        let mut child = manager.spawn_process(&request).await.unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        assert!(manager.set_priority(pid, ProcessPriority::BelowNormal).await.is_ok());
    }

    #[tokio::test]
    async fn test_lowering_priority_of_live_process() {
        let manager = UnixProcessManager::new();
        let request = SpawnRequest::new("sleep", ["5"]);
        let mut child = manager.spawn_process(&request).await.unwrap();
        let pid = child.id().unwrap();

        manager.set_priority(pid, ProcessPriority::Idle).await.unwrap();
        assert_eq!(manager.platform_name(), "Unix");

        child.kill().await.unwrap();
    }
}
