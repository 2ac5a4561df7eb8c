//! Service Control Manager status sink.

use svcwrap_core::{ServiceState, ServiceStatus, StatusSink};

/// Reports status through `SetServiceStatus` for a registered service handle
#[derive(Debug, Clone, Copy)]
pub struct ScmStatusSink {
    handle: isize,
    accept_preshutdown: bool,
}

impl ScmStatusSink {
    /// `handle` is the raw value returned by `RegisterServiceCtrlHandlerExW`
    pub fn from_raw(handle: isize, accept_preshutdown: bool) -> Self {
        Self {
            handle,
            accept_preshutdown,
        }
    }

    /// Controls the service accepts in a given state
    pub fn controls_accepted(&self, state: ServiceState) -> u32 {
        const ACCEPT_STOP: u32 = 0x0000_0001;
        const ACCEPT_SHUTDOWN: u32 = 0x0000_0004;
        const ACCEPT_PRESHUTDOWN: u32 = 0x0000_0100;

        match state {
            ServiceState::Running => {
                let mut accepted = ACCEPT_STOP | ACCEPT_SHUTDOWN;
                if self.accept_preshutdown {
                    accepted |= ACCEPT_PRESHUTDOWN;
                }
                accepted
            }
            _ => 0,
        }
    }

    /// `(win32 exit code, service specific exit code)` for a child exit code
    pub fn exit_codes(exit_code: i32) -> (u32, u32) {
        const ERROR_SERVICE_SPECIFIC_ERROR: u32 = 1066;
        if exit_code == 0 {
            (0, 0)
        } else {
            (ERROR_SERVICE_SPECIFIC_ERROR, exit_code as u32)
        }
    }
}

#[cfg(windows)]
impl StatusSink for ScmStatusSink {
    fn set_status(&self, status: &ServiceStatus) -> anyhow::Result<()> {
        use windows::Win32::System::Services::{
            SERVICE_RUNNING, SERVICE_START_PENDING, SERVICE_STATUS, SERVICE_STATUS_HANDLE,
            SERVICE_STOP_PENDING, SERVICE_STOPPED, SERVICE_WIN32_OWN_PROCESS, SetServiceStatus,
        };

        let (win32_exit, specific_exit) = Self::exit_codes(status.exit_code);
        let raw = SERVICE_STATUS {
            dwServiceType: SERVICE_WIN32_OWN_PROCESS,
            dwCurrentState: match status.state {
                ServiceState::Stopped => SERVICE_STOPPED,
                ServiceState::StartPending => SERVICE_START_PENDING,
                ServiceState::StopPending => SERVICE_STOP_PENDING,
                ServiceState::Running => SERVICE_RUNNING,
            },
            dwControlsAccepted: self.controls_accepted(status.state),
            dwWin32ExitCode: win32_exit,
            dwServiceSpecificExitCode: specific_exit,
            dwCheckPoint: status.checkpoint,
            dwWaitHint: status.wait_hint.as_millis().min(u32::MAX as u128) as u32,
        };

        // SAFETY: the handle stays valid for the lifetime of the service
        unsafe { SetServiceStatus(SERVICE_STATUS_HANDLE(self.handle as *mut _), &raw)? };
        Ok(())
    }
}

#[cfg(not(windows))]
impl StatusSink for ScmStatusSink {
    fn set_status(&self, status: &ServiceStatus) -> anyhow::Result<()> {
        anyhow::bail!(
            "no service control manager on this platform (state {:?})",
            status.state
        )
    }
}
