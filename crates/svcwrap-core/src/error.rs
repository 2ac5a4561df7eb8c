use thiserror::Error;

/// One failed download, kept for the aggregated report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFailure {
    pub from: String,
    pub to: String,
    pub message: String,
}

impl std::fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}: {}", self.from, self.to, self.message)
    }
}

/// Core error types for svcwrap operations
#[derive(Error, Debug)]
pub enum WrapperError {
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{} download(s) failed: {}", failures.len(), join_failures(failures))]
    Download { failures: Vec<DownloadFailure> },

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Service status error: {0}")]
    Status(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

fn join_failures(failures: &[DownloadFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl WrapperError {
    pub fn spawn(message: impl Into<String>) -> Self {
        WrapperError::Spawn(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        WrapperError::Configuration(message.into())
    }

    /// Errors that abort the starting phase of the service.
    pub fn is_fatal_to_phase(&self) -> bool {
        matches!(
            self,
            WrapperError::Spawn(_)
                | WrapperError::Configuration(_)
                | WrapperError::Download { .. }
        )
    }

    /// Errors that are logged and then ignored by the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WrapperError::Io(_) | WrapperError::Timeout(_))
    }
}

pub type Result<T, E = WrapperError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert!(WrapperError::spawn("missing.exe").is_fatal_to_phase());
        assert!(WrapperError::configuration("bad").is_fatal_to_phase());
        assert!(!WrapperError::Timeout("stop".to_string()).is_fatal_to_phase());

        let io = WrapperError::from(std::io::Error::other("rename failed"));
        assert!(io.is_recoverable());
        assert!(!WrapperError::spawn("x").is_recoverable());
    }

    #[test]
    fn test_download_error_display_lists_every_failure() {
        let error = WrapperError::Download {
            failures: vec![
                DownloadFailure {
                    from: "http://a/x".to_string(),
                    to: "x".to_string(),
                    message: "404".to_string(),
                },
                DownloadFailure {
                    from: "http://a/y".to_string(),
                    to: "y".to_string(),
                    message: "timeout".to_string(),
                },
            ],
        };
        let display = format!("{error}");
        assert!(display.starts_with("2 download(s) failed"));
        assert!(display.contains("http://a/x -> x: 404"));
        assert!(display.contains("http://a/y -> y: timeout"));
        assert!(error.is_fatal_to_phase());
    }

    #[test]
    fn test_error_debug_format() {
        let error = WrapperError::spawn("test command");
        let debug_str = format!("{error:?}");
        assert!(debug_str.contains("Spawn"));
        assert!(debug_str.contains("test command"));
    }
}
