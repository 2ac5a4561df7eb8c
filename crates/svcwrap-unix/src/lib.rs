mod unix_process_manager;

pub use unix_process_manager::UnixProcessManager;

pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl svcwrap_core::ProcessManagerFactory for UnixProcessManagerFactory {
    fn create_process_manager() -> std::sync::Arc<dyn svcwrap_core::ProcessManager> {
        std::sync::Arc::new(UnixProcessManager::new())
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
