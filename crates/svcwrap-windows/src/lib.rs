//! Windows-specific process management and service status reporting

mod scm_status;
mod windows_process_manager;

use std::sync::Arc;
use svcwrap_core::{ProcessManager, ProcessManagerFactory};

pub use scm_status::ScmStatusSink;
pub use windows_process_manager::WindowsProcessManager;

/// Windows-specific process manager factory
pub struct WindowsProcessManagerFactory;

impl ProcessManagerFactory for WindowsProcessManagerFactory {
    fn create_process_manager() -> Arc<dyn ProcessManager> {
        Arc::new(WindowsProcessManager::new())
    }

    fn platform_name() -> &'static str {
        "Windows"
    }
}
