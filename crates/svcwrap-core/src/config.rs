use crate::error::WrapperError;
use crate::process::ProcessPriority;
use crate::rotation::{LogConfig, RotationPolicy, detect_periodicity};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// How a download authenticates against the remote server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum AuthMode {
    #[default]
    None,
    /// Use the credentials of the account the service runs under
    IntegratedCredentials,
    Basic {
        username: String,
        password: String,
    },
}

/// A remote artifact fetched before the main process starts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSpec {
    pub from: String,
    pub to: PathBuf,
    #[serde(default)]
    pub auth: AuthMode,
    /// Proxy in `[scheme://][user:pass@]host[:port]` form
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub fail_on_error: bool,
    /// Give up when connecting or any read makes no progress for this long
    #[serde(default = "default_download_timeout_ms")]
    pub timeout_ms: u64,
}

impl DownloadSpec {
    pub fn new(from: impl Into<String>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            auth: AuthMode::None,
            proxy: None,
            fail_on_error: false,
            timeout_ms: default_download_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn fail_on_error(mut self, fail: bool) -> Self {
        self.fail_on_error = fail;
        self
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

/// A short-lived process run around the main process lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Append the hook's stdout to this file; discarded when unset
    #[serde(default)]
    pub stdout_path: Option<PathBuf>,
    /// Append the hook's stderr to this file; discarded when unset
    #[serde(default)]
    pub stderr_path: Option<PathBuf>,
}

impl HookSpec {
    pub fn new<S: ToString, I: IntoIterator<Item = S>>(executable: impl Into<String>, args: I) -> Self {
        Self {
            executable: executable.into(),
            arguments: args.into_iter().map(|s| s.to_string()).collect(),
            stdout_path: None,
            stderr_path: None,
        }
    }
}

/// Which lifecycle point a hook runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreStart,
    PostStart,
    PreStop,
    PostStop,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::PreStart => "prestart",
            HookKind::PostStart => "poststart",
            HookKind::PreStop => "prestop",
            HookKind::PostStop => "poststop",
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved service description consumed by the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into, strip_option))]
pub struct ServiceConfig {
    pub id: String,
    pub executable: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub arguments: Vec<String>,
    #[builder(default)]
    #[serde(default)]
    pub stop_executable: Option<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub stop_arguments: Option<Vec<String>>,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[builder(default)]
    #[serde(default)]
    pub pre_start: Option<HookSpec>,
    #[builder(default)]
    #[serde(default)]
    pub post_start: Option<HookSpec>,
    #[builder(default)]
    #[serde(default)]
    pub pre_stop: Option<HookSpec>,
    #[builder(default)]
    #[serde(default)]
    pub post_stop: Option<HookSpec>,
    #[builder(default)]
    #[serde(default)]
    pub log: LogConfig,
    #[builder(default = "default_stop_timeout_ms()")]
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[builder(default = "default_wait_hint_ms()")]
    #[serde(default = "default_wait_hint_ms")]
    pub wait_hint_ms: u64,
    /// Length of one wait slice between pending-status refreshes
    #[builder(default = "default_sleep_time_ms()")]
    #[serde(default = "default_sleep_time_ms")]
    pub sleep_time_ms: u64,
    #[builder(default)]
    #[serde(default)]
    pub priority: ProcessPriority,
    #[builder(default)]
    #[serde(default)]
    pub hide_window: bool,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub downloads: Vec<DownloadSpec>,
    #[builder(default)]
    #[serde(default)]
    pub intercept_preshutdown: bool,
    #[builder(default = "true")]
    #[serde(default = "default_stop_parent_process_first")]
    pub stop_parent_process_first: bool,
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn wait_hint(&self) -> Duration {
        Duration::from_millis(self.wait_hint_ms)
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_millis(self.sleep_time_ms)
    }

    /// Base name for log files, falling back to the service id
    pub fn log_base_name(&self) -> &str {
        if self.log.base_name.is_empty() {
            &self.id
        } else {
            &self.log.base_name
        }
    }

    /// Whether a dedicated stop command replaces killing the process tree
    pub fn has_stop_command(&self) -> bool {
        self.stop_arguments.is_some() || self.stop_executable.is_some()
    }

    /// The stop executable, defaulting to the main executable
    pub fn effective_stop_executable(&self) -> &str {
        self.stop_executable.as_deref().unwrap_or(&self.executable)
    }

    pub fn hook(&self, kind: HookKind) -> Option<&HookSpec> {
        match kind {
            HookKind::PreStart => self.pre_start.as_ref(),
            HookKind::PostStart => self.post_start.as_ref(),
            HookKind::PreStop => self.pre_stop.as_ref(),
            HookKind::PostStop => self.post_stop.as_ref(),
        }
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), WrapperError> {
        if self.id.trim().is_empty() {
            return Err(WrapperError::configuration("service id must not be empty"));
        }
        if self.executable.trim().is_empty() {
            return Err(WrapperError::configuration("executable must not be empty"));
        }
        if self.sleep_time_ms == 0 {
            return Err(WrapperError::configuration("sleep_time_ms must be positive"));
        }
        if self.sleep_time_ms >= self.wait_hint_ms {
            return Err(WrapperError::configuration(format!(
                "sleep_time_ms ({}) must be shorter than wait_hint_ms ({})",
                self.sleep_time_ms, self.wait_hint_ms
            )));
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(WrapperError::configuration(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
        }
        match &self.log.policy {
            RotationPolicy::TimeBased { pattern, period } => {
                if *period == 0 {
                    return Err(WrapperError::configuration("time-based period must be positive"));
                }
                detect_periodicity(pattern)?;
            }
            RotationPolicy::SizeBased {
                threshold_bytes,
                keep_files,
            } => {
                if *threshold_bytes == 0 {
                    return Err(WrapperError::configuration("size threshold must be positive"));
                }
                if *keep_files == 0 {
                    return Err(WrapperError::configuration("keep_files must be at least 1"));
                }
            }
            RotationPolicy::SizeAndTimeArchived { threshold_bytes, .. } => {
                if *threshold_bytes == 0 {
                    return Err(WrapperError::configuration("size threshold must be positive"));
                }
            }
            RotationPolicy::Append | RotationPolicy::Reset | RotationPolicy::RollOnce => {}
        }
        for download in &self.downloads {
            if download.from.trim().is_empty() {
                return Err(WrapperError::configuration("download source must not be empty"));
            }
            if download.timeout_ms == 0 {
                return Err(WrapperError::configuration("download timeout must be positive"));
            }
        }
        Ok(())
    }
}

impl ServiceConfigBuilder {
    pub fn arguments<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.arguments = Some(args);
        self
    }

    pub fn stop_arguments<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.stop_arguments = Some(Some(args));
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn download(&mut self, spec: DownloadSpec) -> &mut Self {
        self.downloads.get_or_insert_with(Vec::new).push(spec);
        self
    }
}

// Default value functions for serde
fn default_stop_timeout_ms() -> u64 {
    15_000
}
fn default_wait_hint_ms() -> u64 {
    15_000
}
fn default_sleep_time_ms() -> u64 {
    1_500
}
fn default_download_timeout_ms() -> u64 {
    60_000
}
fn default_stop_parent_process_first() -> bool {
    true
}
