use anyhow::Result;
use async_trait::async_trait;
use svcwrap_core::{
    ProcessId, ProcessLifecycle, ProcessManager, ProcessPriority, ProcessTermination,
    SpawnRequest, TerminationResult,
};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// CREATE_NO_WINDOW: start without a console window
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// `taskkill` exit code when no process has the requested pid
const TASKKILL_NOT_FOUND: i32 = 128;

/// Map a finished `taskkill` run to a termination result
fn classify_taskkill(code: Option<i32>, stderr: &str) -> TerminationResult {
    match code {
        Some(0) => TerminationResult::Success,
        Some(TASKKILL_NOT_FOUND) => TerminationResult::ProcessNotFound,
        _ => {
            let message = stderr.trim();
            if message.contains("Access is denied") {
                TerminationResult::AccessDenied
            } else if message.is_empty() {
                TerminationResult::Failed(match code {
                    Some(code) => format!("taskkill exited with {code}"),
                    None => "taskkill was terminated".to_string(),
                })
            } else {
                TerminationResult::Failed(message.to_string())
            }
        }
    }
}

/// Windows process manager built on `taskkill` and the Win32 priority API
#[derive(Debug, Default)]
pub struct WindowsProcessManager;

impl WindowsProcessManager {
    pub fn new() -> Self {
        Self
    }

    /// Run `taskkill /PID <pid>`, with `/F` when forced
    async fn taskkill(&self, pid: ProcessId, force: bool) -> Result<TerminationResult> {
        let pid_string = pid.to_string();
        let mut args = vec!["/PID", pid_string.as_str()];
        if force {
            args.push("/F");
        }

        let mut cmd = Command::new("taskkill");
        cmd.args(&args);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let output = cmd.output().await?;
        Ok(classify_taskkill(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn terminate(&self, pid: ProcessId, force: bool) -> TerminationResult {
        match self.taskkill(pid, force).await {
            Ok(TerminationResult::Success) => {
                info!(pid = %pid, force, "Sent termination to process");
                TerminationResult::Success
            }
            Ok(TerminationResult::ProcessNotFound) => {
                debug!(pid = %pid, "Process not found for termination");
                TerminationResult::ProcessNotFound
            }
            Ok(other) => {
                warn!(pid = %pid, force, result = ?other, "taskkill refused to terminate process");
                other
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to run taskkill");
                TerminationResult::Failed(format!("taskkill failed: {e}"))
            }
        }
    }
}

#[async_trait]
impl ProcessLifecycle for WindowsProcessManager {
    async fn spawn_process(&self, request: &SpawnRequest) -> std::io::Result<Child> {
        #[allow(unused_mut)]
        let mut cmd = request.command();

        #[cfg(windows)]
        if request.hide_window {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let child = cmd.spawn()?;
        if let Some(pid) = child.id() {
            info!(
                pid = %pid,
                command = %request.executable,
                args = ?request.arguments,
                "Spawned Windows process"
            );
        }
        Ok(child)
    }

    async fn set_priority(&self, pid: ProcessId, priority: ProcessPriority) -> Result<()> {
        #[cfg(windows)]
        {
            win32::set_priority_class(pid, priority)
        }
        #[cfg(not(windows))]
        {
            debug!(pid = %pid, ?priority, "Priority classes are only available on Windows");
            Ok(())
        }
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
        self.terminate(pid, false).await
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        self.terminate(pid, true).await
    }
}

impl ProcessManager for WindowsProcessManager {
    fn platform_name(&self) -> &'static str {
        "Windows"
    }
}

#[cfg(windows)]
mod win32 {
    use super::*;
    use windows::Win32::Foundation::{CloseHandle, ERROR_INVALID_PARAMETER};
    use windows::Win32::System::Threading::{
        ABOVE_NORMAL_PRIORITY_CLASS, BELOW_NORMAL_PRIORITY_CLASS, HIGH_PRIORITY_CLASS,
        IDLE_PRIORITY_CLASS, NORMAL_PRIORITY_CLASS, OpenProcess, PROCESS_CREATION_FLAGS,
        PROCESS_SET_INFORMATION, REALTIME_PRIORITY_CLASS, SetPriorityClass,
    };

    fn priority_class(priority: ProcessPriority) -> PROCESS_CREATION_FLAGS {
        match priority {
            ProcessPriority::Idle => IDLE_PRIORITY_CLASS,
            ProcessPriority::BelowNormal => BELOW_NORMAL_PRIORITY_CLASS,
            ProcessPriority::Normal => NORMAL_PRIORITY_CLASS,
            ProcessPriority::AboveNormal => ABOVE_NORMAL_PRIORITY_CLASS,
            ProcessPriority::High => HIGH_PRIORITY_CLASS,
            ProcessPriority::RealTime => REALTIME_PRIORITY_CLASS,
        }
    }

    pub(super) fn set_priority_class(pid: ProcessId, priority: ProcessPriority) -> Result<()> {
        // SAFETY: the handle is checked by the windows crate and closed below
        unsafe {
            let handle = match OpenProcess(PROCESS_SET_INFORMATION, false, pid) {
                Ok(handle) => handle,
                Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => {
                    debug!(pid = %pid, "Process exited before its priority could be set");
                    return Ok(());
                }
                Err(e) => return Err(anyhow::anyhow!("OpenProcess({pid}) failed: {e}")),
            };
            let result = SetPriorityClass(handle, priority_class(priority));
            let _ = CloseHandle(handle);
            result.map_err(|e| anyhow::anyhow!("SetPriorityClass({pid}) failed: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taskkill_exit_codes() {
        assert_eq!(classify_taskkill(Some(0), ""), TerminationResult::Success);
        assert_eq!(
            classify_taskkill(
                Some(128),
                "ERROR: The process \"4242\" not found.\r\n"
            ),
            TerminationResult::ProcessNotFound
        );
        assert_eq!(
            classify_taskkill(
                Some(1),
                "ERROR: The process with PID 4242 could not be terminated.\r\n\
                 Reason: This process can only be terminated forcefully (with /F option).\r\n"
            ),
            TerminationResult::Failed(
                "ERROR: The process with PID 4242 could not be terminated.\r\n\
                 Reason: This process can only be terminated forcefully (with /F option)."
                    .to_string()
            )
        );
        assert_eq!(
            classify_taskkill(
                Some(1),
                "ERROR: The process with PID 4 could not be terminated.\r\nReason: Access is denied.\r\n"
            ),
            TerminationResult::AccessDenied
        );
        assert_eq!(
            classify_taskkill(Some(255), "  "),
            TerminationResult::Failed("taskkill exited with 255".to_string())
        );
    }
}
