//! Pre-start downloads.
//!
//! Each task fetches one artifact to `<to>.tmp` and renames it over `<to>` only
//! once the whole body has arrived, so an interrupted transfer leaves the
//! previous file untouched.

use crate::config::{AuthMode, DownloadSpec};
use crate::error::{DownloadFailure, Result, WrapperError};
use crate::event::EventLogger;
use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::future::join_all;
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{Client, Proxy, StatusCode};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Pending,
    Succeeded,
    SkippedNotModified,
    Failed(String),
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadState::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { bytes: u64 },
    NotModified,
}

/// Proxy address with credentials split out of `user:pass@host` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub url: String,
    pub credentials: Option<(String, String)>,
}

impl ProxySettings {
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let spec = spec.trim();
        let with_scheme = if spec.contains("://") {
            spec.to_string()
        } else {
            format!("http://{spec}")
        };
        let mut url = url::Url::parse(&with_scheme).with_context(|| format!("invalid proxy {spec:?}"))?;

        let credentials = if url.username().is_empty() {
            None
        } else {
            let user = url.username().to_string();
            let pass = url.password().unwrap_or_default().to_string();
            Some((user, pass))
        };
        url.set_username("")
            .map_err(|_| anyhow!("cannot strip credentials from proxy {spec:?}"))?;
        url.set_password(None)
            .map_err(|_| anyhow!("cannot strip credentials from proxy {spec:?}"))?;

        Ok(Self {
            url: url.to_string(),
            credentials,
        })
    }

    pub fn to_proxy(&self) -> anyhow::Result<Proxy> {
        let proxy = Proxy::all(self.url.as_str())?;
        Ok(match &self.credentials {
            Some((user, pass)) => proxy.basic_auth(user, pass),
            None => proxy,
        })
    }
}

/// HTTP-date (`IMF-fixdate`) for a timestamp
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| SystemTime::from(t.with_timezone(&Utc)))
}

fn tmp_path(to: &Path) -> PathBuf {
    let mut name = to.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

pub struct DownloadTask {
    spec: DownloadSpec,
    state: DownloadState,
}

impl DownloadTask {
    pub fn new(spec: DownloadSpec) -> Self {
        Self {
            spec,
            state: DownloadState::Pending,
        }
    }

    pub fn spec(&self) -> &DownloadSpec {
        &self.spec
    }

    pub fn state(&self) -> &DownloadState {
        &self.state
    }

    /// A client bounded by this task's timeout, using its explicit proxy when set
    pub fn client(&self) -> anyhow::Result<Client> {
        let timeout = self.spec.timeout();
        let mut builder = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout);
        if let Some(proxy) = &self.spec.proxy {
            let settings = ProxySettings::parse(proxy)?;
            builder = builder.proxy(settings.to_proxy()?);
        }
        Ok(builder.build()?)
    }

    /// Run the transfer once; the task is terminal afterwards
    pub async fn perform(&mut self, client: &Client) -> Result<DownloadOutcome> {
        if self.state.is_terminal() {
            return Err(WrapperError::InvalidState(format!(
                "download of {} already finished as {:?}",
                self.spec.from, self.state
            )));
        }

        match self.transfer(client).await {
            Ok(outcome) => {
                self.state = match outcome {
                    DownloadOutcome::Downloaded { .. } => DownloadState::Succeeded,
                    DownloadOutcome::NotModified => DownloadState::SkippedNotModified,
                };
                Ok(outcome)
            }
            Err(e) => {
                self.state = DownloadState::Failed(format!("{e:#}"));
                Err(WrapperError::Other(e))
            }
        }
    }

    async fn transfer(&self, client: &Client) -> anyhow::Result<DownloadOutcome> {
        let spec = &self.spec;
        let mut request = client.get(&spec.from);

        if let Ok(metadata) = tokio::fs::metadata(&spec.to).await {
            if let Ok(modified) = metadata.modified() {
                request = request.header(IF_MODIFIED_SINCE, http_date(modified));
            }
        }

        match &spec.auth {
            AuthMode::None => {}
            AuthMode::IntegratedCredentials => {
                debug!(from = %spec.from, "Relying on platform credentials for download");
            }
            AuthMode::Basic { username, password } => {
                request = request.basic_auth(username, Some(password));
            }
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request {}", spec.from))?;
        if response.status() == StatusCode::NOT_MODIFIED {
            info!(from = %spec.from, to = %spec.to.display(), "Download skipped, not modified");
            return Ok(DownloadOutcome::NotModified);
        }
        let response = response.error_for_status()?;
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        let tmp = tmp_path(&spec.to);
        let bytes = match Self::write_body(&tmp, response, last_modified).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&tmp).await {
                    debug!(path = %tmp.display(), error = %remove_err, "Temporary file not removed");
                }
                return Err(e);
            }
        };

        tokio::fs::rename(&tmp, &spec.to)
            .await
            .with_context(|| format!("replace {}", spec.to.display()))?;
        info!(from = %spec.from, to = %spec.to.display(), bytes, "Downloaded");
        Ok(DownloadOutcome::Downloaded { bytes })
    }

    async fn write_body(
        tmp: &Path,
        response: reqwest::Response,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<u64> {
        let mut file = tokio::fs::File::create(tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("transfer interrupted")?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        let file = file.into_std().await;
        if let Some(modified) = last_modified {
            file.set_modified(modified)?;
        }
        file.sync_all()?;
        Ok(written)
    }
}

/// Run every task concurrently and collect the failures that must stop startup
pub async fn run_downloads(
    tasks: Vec<DownloadTask>,
    events: &dyn EventLogger,
) -> Result<Vec<DownloadTask>> {
    let finished = join_all(tasks.into_iter().map(|mut task| async move {
        let result = match task.client() {
            Ok(client) => task.perform(&client).await.map(|_| ()),
            Err(e) => {
                task.state = DownloadState::Failed(format!("{e:#}"));
                Err(WrapperError::Other(e))
            }
        };
        (task, result)
    }))
    .await;

    let mut failures = Vec::new();
    let mut tasks = Vec::with_capacity(finished.len());
    for (task, result) in finished {
        if let Err(e) = result {
            let failure = DownloadFailure {
                from: task.spec.from.clone(),
                to: task.spec.to.display().to_string(),
                message: match task.state() {
                    DownloadState::Failed(message) => message.clone(),
                    _ => e.to_string(),
                },
            };
            if task.spec.fail_on_error {
                events.error(&format!("Download failed: {failure}"));
                failures.push(failure);
            } else {
                warn!(from = %failure.from, error = %failure.message, "Download failed, continuing");
                events.warning(&format!("Download failed, continuing: {failure}"));
            }
        }
        tasks.push(task);
    }

    if failures.is_empty() {
        Ok(tasks)
    } else {
        Err(WrapperError::Download { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemoryEventLogger;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serves one canned response per connection and reports each request head
    async fn serve(responses: Vec<Vec<u8>>) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_target(false)
            .try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
                socket.write_all(&response).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (addr, rx)
    }

    fn response(status: &str, headers: &[&str], body: &[u8]) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
        for header in headers {
            out.push_str(header);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        let mut out = out.into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn test_download_replaces_destination_and_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("app.jar");
        let (addr, mut requests) = serve(vec![response(
            "200 OK",
            &["Last-Modified: Wed, 21 Oct 2015 07:28:00 GMT"],
            b"artifact-bytes",
        )])
        .await;

        let mut task = DownloadTask::new(
            DownloadSpec::new(format!("http://{addr}/app.jar"), &to).with_auth(AuthMode::Basic {
                username: "u".to_string(),
                password: "p".to_string(),
            }),
        );
        let outcome = task.perform(&Client::new()).await.unwrap();

        assert_eq!(outcome, DownloadOutcome::Downloaded { bytes: 14 });
        assert_eq!(task.state(), &DownloadState::Succeeded);
        assert_eq!(std::fs::read(&to).unwrap(), b"artifact-bytes");
        assert!(!tmp_path(&to).exists());

        let modified = std::fs::metadata(&to).unwrap().modified().unwrap();
        assert_eq!(http_date(modified), "Wed, 21 Oct 2015 07:28:00 GMT");

        let head = requests.recv().await.unwrap().to_lowercase();
        assert!(head.contains("authorization: basic dtpw"), "{head}");
        assert!(!head.contains("if-modified-since"));
    }

    #[tokio::test]
    async fn test_not_modified_keeps_local_copy() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("config.xml");
        std::fs::write(&to, "local").unwrap();
        let (addr, mut requests) = serve(vec![response("304 Not Modified", &[], b"")]).await;

        let mut task = DownloadTask::new(DownloadSpec::new(format!("http://{addr}/config.xml"), &to));
        let outcome = task.perform(&Client::new()).await.unwrap();

        assert_eq!(outcome, DownloadOutcome::NotModified);
        assert_eq!(task.state(), &DownloadState::SkippedNotModified);
        assert_eq!(std::fs::read_to_string(&to).unwrap(), "local");
        let head = requests.recv().await.unwrap().to_lowercase();
        assert!(head.contains("if-modified-since: "), "{head}");

        assert!(matches!(
            task.perform(&Client::new()).await,
            Err(WrapperError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupted_transfer_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("data.bin");
        std::fs::write(&to, "good data").unwrap();

        let mut truncated =
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 1000\r\n\r\n".to_vec();
        truncated.extend_from_slice(&[b'x'; 100]);
        let (addr, _requests) = serve(vec![truncated]).await;

        let mut task = DownloadTask::new(DownloadSpec::new(format!("http://{addr}/data.bin"), &to));
        let result = tokio::time::timeout(Duration::from_secs(10), task.perform(&Client::new()))
            .await
            .unwrap();

        assert!(result.is_err());
        assert!(matches!(task.state(), DownloadState::Failed(_)));
        assert_eq!(std::fs::read_to_string(&to).unwrap(), "good data");
        assert!(!tmp_path(&to).exists());
    }

    #[tokio::test]
    async fn test_failures_are_aggregated_by_fail_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _requests) = serve(vec![
            response("404 Not Found", &[], b""),
            response("404 Not Found", &[], b""),
            response("404 Not Found", &[], b""),
        ])
        .await;
        let events = MemoryEventLogger::new();

        let tasks = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                DownloadTask::new(
                    DownloadSpec::new(format!("http://{addr}/{name}"), dir.path().join(name))
                        .fail_on_error(i < 2),
                )
            })
            .collect();

        match run_downloads(tasks, &events).await {
            Err(WrapperError::Download { failures }) => {
                assert_eq!(failures.len(), 2);
                let sources: Vec<_> = failures.iter().map(|f| f.from.clone()).collect();
                assert!(sources.contains(&format!("http://{addr}/a")));
                assert!(sources.contains(&format!("http://{addr}/b")));
            }
            other => panic!("expected aggregated failure, got {:?}", other.map(|t| t.len())),
        }
        assert!(events.contains("continuing"));
    }

    #[tokio::test]
    async fn test_stalled_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts and never answers
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let events = MemoryEventLogger::new();
        let tasks = vec![DownloadTask::new(
            DownloadSpec::new(format!("http://{addr}/slow.bin"), dir.path().join("slow.bin"))
                .fail_on_error(true)
                .with_timeout(Duration::from_millis(300)),
        )];

        let result = tokio::time::timeout(Duration::from_secs(10), run_downloads(tasks, &events))
            .await
            .expect("download should give up on a silent server");

        match result {
            Err(WrapperError::Download { failures }) => assert_eq!(failures.len(), 1),
            other => panic!("expected a timed out download, got {:?}", other.map(|t| t.len())),
        }
        assert!(!dir.path().join("slow.bin").exists());
    }

    #[tokio::test]
    async fn test_tolerated_failure_does_not_block_startup() {
        let dir = tempfile::tempdir().unwrap();
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let events = MemoryEventLogger::new();
        let tasks = vec![DownloadTask::new(DownloadSpec::new(
            format!("http://{addr}/missing"),
            dir.path().join("missing"),
        ))];

        let finished = run_downloads(tasks, &events).await.unwrap();
        assert!(matches!(finished[0].state(), DownloadState::Failed(_)));
    }

    #[test]
    fn test_proxy_credentials_are_split_out() {
        let proxy = ProxySettings::parse("user:secret@proxy.local:3128").unwrap();
        assert_eq!(proxy.url, "http://proxy.local:3128/");
        assert_eq!(
            proxy.credentials,
            Some(("user".to_string(), "secret".to_string()))
        );

        let plain = ProxySettings::parse("https://gateway:8443").unwrap();
        assert_eq!(plain.url, "https://gateway:8443/");
        assert!(plain.credentials.is_none());
        assert!(plain.to_proxy().is_ok());
    }

    #[test]
    fn test_http_date_round_trip() {
        let parsed = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(http_date(parsed), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
