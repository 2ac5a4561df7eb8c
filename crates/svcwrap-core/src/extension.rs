use crate::process::ManagedProcess;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::error;

/// Passive observer of the wrapper lifecycle.
///
/// Notifications are delivered in order on the supervisor's control path.
/// An extension cannot veto or reorder anything; a panicking extension is
/// logged and skipped.
pub trait WrapperExtension: Send + Sync {
    fn name(&self) -> &str;

    fn on_wrapper_started(&self) {}

    fn on_process_started(&self, _process: &ManagedProcess) {}

    fn on_process_terminated(&self, _process: &ManagedProcess) {}

    fn on_before_wrapper_stopped(&self) {}
}

#[derive(Clone, Default)]
pub struct ExtensionSet {
    extensions: Vec<Arc<dyn WrapperExtension>>,
}

impl ExtensionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Arc<dyn WrapperExtension>) {
        self.extensions.push(extension);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn wrapper_started(&self) {
        self.each("on_wrapper_started", |ext| ext.on_wrapper_started());
    }

    pub fn process_started(&self, process: &ManagedProcess) {
        self.each("on_process_started", |ext| ext.on_process_started(process));
    }

    pub fn process_terminated(&self, process: &ManagedProcess) {
        self.each("on_process_terminated", |ext| ext.on_process_terminated(process));
    }

    pub fn before_wrapper_stopped(&self) {
        self.each("on_before_wrapper_stopped", |ext| ext.on_before_wrapper_stopped());
    }

    fn each(&self, hook: &str, f: impl Fn(&dyn WrapperExtension)) {
        for extension in &self.extensions {
            if catch_unwind(AssertUnwindSafe(|| f(extension.as_ref()))).is_err() {
                error!(extension = extension.name(), hook, "Extension panicked");
            }
        }
    }
}

impl std::fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.extensions.iter().map(|e| e.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<&'static str>>);

    impl WrapperExtension for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_wrapper_started(&self) {
            self.0.lock().unwrap().push("started");
        }

        fn on_before_wrapper_stopped(&self) {
            self.0.lock().unwrap().push("stopping");
        }
    }

    struct Panicky;

    impl WrapperExtension for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn on_wrapper_started(&self) {
            panic!("extension bug");
        }
    }

    #[test]
    fn test_panicking_extension_does_not_stop_others() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut set = ExtensionSet::new();
        set.register(Arc::new(Panicky));
        set.register(recorder.clone());

        set.wrapper_started();
        set.before_wrapper_stopped();

        assert_eq!(*recorder.0.lock().unwrap(), vec!["started", "stopping"]);
        assert_eq!(format!("{set:?}"), r#"["panicky", "recorder"]"#);
    }
}
