//! Output capture and log rotation for supervised processes.
//!
//! Each enabled output side gets its own copy loop task. Loops end when the
//! pipe reaches end of stream, which happens once the process exits.

mod archived;
mod files;
mod pattern;
mod simple;
mod size_based;
mod time_based;

pub use archived::{ArchivedSettings, next_sequence_number, sweep_archives};
pub use pattern::{DatePattern, PeriodicityUnit, RollSchedule, detect_periodicity};
pub use size_based::shift_backups;

use crate::event::EventLogger;
use chrono::{Local, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How captured output files are rolled over
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RotationPolicy {
    /// One file per side, appended to forever
    #[default]
    Append,
    /// One file per side, truncated when the process starts
    Reset,
    /// The previous file is renamed to `<name>.old`, then appended to
    RollOnce,
    /// A new file whenever `period` units of the pattern's periodicity pass
    #[serde(rename_all = "camelCase")]
    TimeBased {
        pattern: String,
        #[serde(default = "default_period")]
        period: u32,
    },
    /// Numbered backups once the active file exceeds the threshold
    #[serde(rename_all = "camelCase")]
    SizeBased {
        #[serde(default = "default_threshold_bytes")]
        threshold_bytes: u64,
        #[serde(default = "default_keep_files")]
        keep_files: u32,
    },
    /// Size rolls into dated, sequenced files with optional daily roll and zip sweep
    #[serde(rename_all = "camelCase")]
    SizeAndTimeArchived {
        #[serde(default = "default_threshold_bytes")]
        threshold_bytes: u64,
        #[serde(default = "default_file_pattern")]
        file_pattern: String,
        #[serde(default)]
        auto_roll_at_time: Option<NaiveTime>,
        #[serde(default)]
        zip_older_than_days: Option<u32>,
        #[serde(default = "default_zip_date_format")]
        zip_date_format: String,
    },
}

/// Where and how the main process output is written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Empty means "use the service id"
    #[serde(default)]
    pub base_name: String,
    #[serde(default)]
    pub policy: RotationPolicy,
    #[serde(default = "default_out_pattern")]
    pub out_pattern: String,
    #[serde(default = "default_err_pattern")]
    pub err_pattern: String,
    #[serde(default)]
    pub out_disabled: bool,
    #[serde(default)]
    pub err_disabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            base_name: String::new(),
            policy: RotationPolicy::Append,
            out_pattern: default_out_pattern(),
            err_pattern: default_err_pattern(),
            out_disabled: false,
            err_disabled: false,
        }
    }
}

impl LogConfig {
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: RotationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_base_name(mut self, base_name: impl Into<String>) -> Self {
        self.base_name = base_name.into();
        self
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}
fn default_out_pattern() -> String {
    ".out.log".to_string()
}
fn default_err_pattern() -> String {
    ".err.log".to_string()
}
fn default_period() -> u32 {
    1
}
fn default_threshold_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_keep_files() -> u32 {
    8
}
fn default_file_pattern() -> String {
    "yyyyMMdd".to_string()
}
fn default_zip_date_format() -> String {
    "yyyyMM".to_string()
}

/// Which output pipe a copy loop serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSide {
    Out,
    Err,
}

impl StreamSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSide::Out => "stdout",
            StreamSide::Err => "stderr",
        }
    }
}

/// Source of the wall-clock time used for naming and scheduling rolls
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Shared context handed to every copy loop
#[derive(Clone)]
pub(crate) struct StreamContext {
    pub directory: PathBuf,
    pub base_name: String,
    pub extension: String,
    pub side: StreamSide,
    pub events: Arc<dyn EventLogger>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: CancellationToken,
}

impl StreamContext {
    /// `<directory>/<base><extension>`
    pub fn active_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}{}", self.base_name, self.extension))
    }

    pub fn path_with_infix(&self, infix: &str) -> PathBuf {
        self.directory
            .join(format!("{}{}{}", self.base_name, infix, self.extension))
    }

    /// Report a housekeeping failure; the copy loop carries on
    pub fn report(&self, message: String) {
        tracing::warn!(side = self.side.as_str(), "{message}");
        self.events.warning(&message);
    }
}

/// Attaches rotation copy loops to a process's output pipes
pub struct LogHandler {
    directory: PathBuf,
    base_name: String,
    policy: RotationPolicy,
    out_pattern: String,
    err_pattern: String,
    out_disabled: bool,
    err_disabled: bool,
    events: Arc<dyn EventLogger>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl LogHandler {
    pub fn new(config: &LogConfig, base_name: &str, events: Arc<dyn EventLogger>) -> Self {
        Self {
            directory: config.directory.clone(),
            base_name: base_name.to_string(),
            policy: config.policy.clone(),
            out_pattern: config.out_pattern.clone(),
            err_pattern: config.err_pattern.clone(),
            out_disabled: config.out_disabled,
            err_disabled: config.err_disabled,
            events,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        }
    }

    /// A single append-mode file per side, used for hook output
    pub fn append_to(
        stdout_path: Option<&Path>,
        stderr_path: Option<&Path>,
        events: Arc<dyn EventLogger>,
    ) -> (Option<Self>, Option<Self>) {
        let single = |path: &Path| {
            let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let config = LogConfig {
                directory,
                base_name: String::new(),
                policy: RotationPolicy::Append,
                out_pattern: file_name.clone(),
                err_pattern: file_name,
                out_disabled: false,
                err_disabled: false,
            };
            Self::new(&config, "", events.clone())
        };
        (stdout_path.map(single), stderr_path.map(single))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    pub fn captures_stdout(&self) -> bool {
        !self.out_disabled
    }

    pub fn captures_stderr(&self) -> bool {
        !self.err_disabled
    }

    /// Path of the active file for one side
    pub fn active_path(&self, side: StreamSide) -> PathBuf {
        self.context(side).active_path()
    }

    /// Stop background timers; copy loops still run to end of stream
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn context(&self, side: StreamSide) -> StreamContext {
        let extension = match side {
            StreamSide::Out => self.out_pattern.clone(),
            StreamSide::Err => self.err_pattern.clone(),
        };
        StreamContext {
            directory: self.directory.clone(),
            base_name: self.base_name.clone(),
            extension,
            side,
            events: self.events.clone(),
            clock: self.clock.clone(),
            shutdown: self.shutdown.child_token(),
        }
    }

    /// Start one copy loop per provided and enabled side
    pub fn attach<O, E>(&self, stdout: Option<O>, stderr: Option<E>) -> Vec<JoinHandle<()>>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        if let Err(e) = std::fs::create_dir_all(&self.directory) {
            self.events.warning(&format!(
                "Failed to create log directory {}: {e}",
                self.directory.display()
            ));
        }

        let mut handles = Vec::new();
        if let Some(reader) = stdout.filter(|_| self.captures_stdout()) {
            handles.push(self.spawn_loop(reader, self.context(StreamSide::Out)));
        }
        if let Some(reader) = stderr.filter(|_| self.captures_stderr()) {
            handles.push(self.spawn_loop(reader, self.context(StreamSide::Err)));
        }
        handles
    }

    fn spawn_loop<R>(&self, reader: R, ctx: StreamContext) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let policy = self.policy.clone();
        tokio::spawn(async move {
            let side = ctx.side.as_str();
            let result = match policy {
                RotationPolicy::Append => simple::run(reader, &ctx, simple::OpenMode::Append).await,
                RotationPolicy::Reset => simple::run(reader, &ctx, simple::OpenMode::Truncate).await,
                RotationPolicy::RollOnce => simple::run(reader, &ctx, simple::OpenMode::RollOnce).await,
                RotationPolicy::TimeBased { pattern, period } => {
                    time_based::run(reader, &ctx, &pattern, period).await
                }
                RotationPolicy::SizeBased {
                    threshold_bytes,
                    keep_files,
                } => size_based::run(reader, &ctx, threshold_bytes, keep_files).await,
                RotationPolicy::SizeAndTimeArchived {
                    threshold_bytes,
                    file_pattern,
                    auto_roll_at_time,
                    zip_older_than_days,
                    zip_date_format,
                } => {
                    let settings = ArchivedSettings {
                        threshold_bytes,
                        file_pattern,
                        auto_roll_at_time,
                        zip_older_than_days,
                        zip_date_format,
                    };
                    archived::run(reader, &ctx, settings).await
                }
            };
            match result {
                Ok(bytes) => debug!(side, bytes, "Output stream closed"),
                Err(e) => ctx.report(format!("Log copy for {side} stopped: {e:#}")),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemoryEventLogger;
    use std::time::Duration;

    #[test]
    fn test_policy_serde_uses_mode_tag() {
        let policy: RotationPolicy =
            serde_json::from_str(r#"{"mode":"sizeBased","thresholdBytes":2048}"#).unwrap();
        assert_eq!(
            policy,
            RotationPolicy::SizeBased {
                threshold_bytes: 2048,
                keep_files: 8
            }
        );

        let archived: RotationPolicy = serde_json::from_str(
            r#"{"mode":"sizeAndTimeArchived","autoRollAtTime":"00:00:00","zipOlderThanDays":5}"#,
        )
        .unwrap();
        match archived {
            RotationPolicy::SizeAndTimeArchived {
                file_pattern,
                zip_date_format,
                zip_older_than_days,
                ..
            } => {
                assert_eq!(file_pattern, "yyyyMMdd");
                assert_eq!(zip_date_format, "yyyyMM");
                assert_eq!(zip_older_than_days, Some(5));
            }
            other => panic!("unexpected policy {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_side_is_not_attached() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            err_disabled: true,
            ..LogConfig::in_directory(dir.path())
        };
        let handler = LogHandler::new(&config, "svc", Arc::new(MemoryEventLogger::new()));

        let out: &'static [u8] = b"hello\n";
        let err: &'static [u8] = b"ignored\n";
        let handles = handler.attach(Some(out), Some(err));
        assert_eq!(handles.len(), 1);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(std::fs::read(dir.path().join("svc.out.log")).unwrap(), b"hello\n");
        assert!(!dir.path().join("svc.err.log").exists());
    }

    #[tokio::test]
    async fn test_hook_output_appends_to_exact_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook-output.txt");
        std::fs::write(&path, b"old\n").unwrap();

        let (out, err) = LogHandler::append_to(Some(&path), None, Arc::new(MemoryEventLogger::new()));
        assert!(err.is_none());
        let out = out.unwrap();
        assert_eq!(out.active_path(StreamSide::Out), path);

        let reader: &'static [u8] = b"new\n";
        for handle in out.attach(Some(reader), None::<&'static [u8]>) {
            handle.await.unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }
}
