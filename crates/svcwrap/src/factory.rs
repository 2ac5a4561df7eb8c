use std::sync::Arc;
use svcwrap_core::{LogStatusSink, ProcessManager, ProcessManagerFactory, StatusSink};

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    fn create_process_manager() -> Arc<dyn ProcessManager> {
        #[cfg(unix)]
        return svcwrap_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return svcwrap_windows::WindowsProcessManagerFactory::create_process_manager();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return svcwrap_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return svcwrap_windows::WindowsProcessManagerFactory::platform_name();
    }
}

/// Convenience function to create a platform-appropriate ProcessManager
pub fn create_process_manager() -> Arc<dyn ProcessManager> {
    PlatformProcessManagerFactory::create_process_manager()
}

/// Status sink for the current platform.
///
/// With a service control handle on Windows, status goes to the SCM. Everywhere
/// else, and when running outside a service, transitions are only logged.
pub fn default_status_sink(scm_handle: Option<isize>, accept_preshutdown: bool) -> Arc<dyn StatusSink> {
    #[cfg(windows)]
    if let Some(handle) = scm_handle {
        return Arc::new(svcwrap_windows::ScmStatusSink::from_raw(handle, accept_preshutdown));
    }

    #[cfg(not(windows))]
    let _ = (scm_handle, accept_preshutdown);

    Arc::new(LogStatusSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_name_matches_manager() {
        let manager = create_process_manager();
        assert_eq!(manager.platform_name(), PlatformProcessManagerFactory::platform_name());
    }
}
