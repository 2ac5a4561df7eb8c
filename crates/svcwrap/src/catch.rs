use std::fmt::Display;
use svcwrap_core::EventLogger;
use tracing::warn;

/// Turn a failure that must not abort the current phase into a logged event
pub trait Recover<T>: Sized {
    fn recover(self, events: &dyn EventLogger, what: &str) -> Option<T>;
}

impl<T, E: Display> Recover<T> for Result<T, E> {
    fn recover(self, events: &dyn EventLogger, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                let message = format!("{what}: {e:#}");
                warn!(error = %e, "{what}");
                events.warning(&message);
                None
            }
        }
    }
}
