//! Size rolls into `<base>.<date>.#NNNN<ext>`, an optional daily roll at a
//! fixed time of day and an optional zip sweep of old rotated files.
//!
//! The daily timer and the copy loop share one lock per stream. When the timer
//! fires in the middle of a line the roll is left pending and the copy loop
//! performs it at the next line start.

use super::StreamContext;
use super::files::{open_append, open_truncate, rename};
use super::pattern::DatePattern;
use crate::copier::{StreamCopier, write_unit};
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedSettings {
    pub threshold_bytes: u64,
    pub file_pattern: String,
    pub auto_roll_at_time: Option<NaiveTime>,
    pub zip_older_than_days: Option<u32>,
    pub zip_date_format: String,
}

struct ActiveFile {
    file: Option<File>,
    size: u64,
    at_boundary: bool,
    roll_pending: Option<NaiveDateTime>,
}

pub(crate) struct ArchivedStream {
    ctx: StreamContext,
    settings: ArchivedSettings,
    file_pattern: DatePattern,
    zip_pattern: DatePattern,
    state: Mutex<ActiveFile>,
}

impl ArchivedStream {
    pub(crate) async fn open(ctx: StreamContext, settings: ArchivedSettings) -> Result<Self> {
        let active = ctx.active_path();
        let size = super::files::file_len(&active).await;
        let file = open_append(&active).await?;
        Ok(Self {
            file_pattern: DatePattern::parse(&settings.file_pattern),
            zip_pattern: DatePattern::parse(&settings.zip_date_format),
            ctx,
            settings,
            state: Mutex::new(ActiveFile {
                file: Some(file),
                size,
                at_boundary: true,
                roll_pending: None,
            }),
        })
    }

    pub(crate) async fn write(&self, chunk: &[u8], starts_line: bool) -> Result<()> {
        let mut state = self.state.lock().await;

        if starts_line {
            if let Some(date) = state.roll_pending.take() {
                self.roll(&mut state, date).await;
            } else if state.size > 0
                && state.size + chunk.len() as u64 > self.settings.threshold_bytes
            {
                let now = self.ctx.clock.now();
                self.roll(&mut state, now).await;
            }
        }

        if state.file.is_none() {
            match open_append(&self.ctx.active_path()).await {
                Ok(file) => state.file = Some(file),
                Err(e) => {
                    self.ctx.report(format!("Dropping output, log file unavailable: {e:#}"));
                    return Ok(());
                }
            }
        }
        if let Some(file) = state.file.as_mut() {
            write_unit(file, chunk).await?;
        }
        state.size += chunk.len() as u64;
        state.at_boundary = chunk.last() == Some(&b'\n');
        Ok(())
    }

    /// Scheduled roll; files are named after the day that just ended
    pub(crate) async fn timer_fired(&self) {
        let date = self.ctx.clock.now() - ChronoDuration::days(1);
        let mut state = self.state.lock().await;
        if state.at_boundary {
            self.roll(&mut state, date).await;
        } else {
            debug!(side = self.ctx.side.as_str(), "Deferring scheduled roll to line end");
            state.roll_pending = Some(date);
        }
    }

    async fn roll(&self, state: &mut ActiveFile, date: NaiveDateTime) {
        if let Some(mut file) = state.file.take() {
            let _ = file.flush().await;
        }

        let active = self.ctx.active_path();
        let date_text = self.file_pattern.format(&date);
        match self.rotated_path(&date_text).await {
            Ok(target) => {
                if let Err(e) = rename(&active, &target).await {
                    self.ctx.report(format!("Failed to roll archived log: {e:#}"));
                } else {
                    debug!(path = %target.display(), "Rolled archived log");
                }
            }
            Err(e) => self.ctx.report(format!("Failed to roll archived log: {e:#}")),
        }

        match open_truncate(&active).await {
            Ok(file) => state.file = Some(file),
            Err(e) => self.ctx.report(format!("Failed to open new log file: {e:#}")),
        }
        state.size = 0;

        self.schedule_sweep();
    }

    async fn rotated_path(&self, date_text: &str) -> Result<PathBuf> {
        let sequence = next_sequence_number(
            &self.ctx.directory,
            &self.ctx.base_name,
            date_text,
            &self.ctx.extension,
        )
        .await?;
        Ok(self
            .ctx
            .path_with_infix(&format!(".{date_text}.#{sequence:04}")))
    }

    fn schedule_sweep(&self) {
        let Some(days) = self.settings.zip_older_than_days else {
            return;
        };
        let ctx = self.ctx.clone();
        let zip_date = self.zip_pattern.format(&ctx.clock.now());
        tokio::spawn(async move {
            let directory = ctx.directory.clone();
            let base = ctx.base_name.clone();
            let ext = ctx.extension.clone();
            let swept = tokio::task::spawn_blocking(move || {
                sweep_archives(&directory, &base, &ext, days, &zip_date, SystemTime::now())
            })
            .await;
            match swept {
                Ok(Ok(0)) => {}
                Ok(Ok(count)) => info!(count, "Archived rotated log files"),
                Ok(Err(e)) => ctx.report(format!("Failed to zip rotated logs: {e:#}")),
                Err(e) => ctx.report(format!("Zip sweep task failed: {e}")),
            }
        });
    }
}

/// One past the highest `#NNNN` already used for this date, starting at 1
pub async fn next_sequence_number(
    directory: &Path,
    base: &str,
    date_text: &str,
    ext: &str,
) -> Result<u32> {
    let prefix = format!("{base}.{date_text}.#");
    let mut highest = 0u32;
    let mut entries = tokio::fs::read_dir(directory)
        .await
        .with_context(|| format!("list {}", directory.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(sequence) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(ext))
            .and_then(|digits| digits.parse::<u32>().ok())
        else {
            continue;
        };
        highest = highest.max(sequence);
    }
    Ok(highest + 1)
}

/// Held for the whole of a sweep; both streams of a service write one zip
static SWEEP_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Move rotated files older than `older_than_days` into `<base>.<zip_date>.zip`.
///
/// Sweeps in this process run one at a time. Returns the number of files
/// archived. Blocking; run on a blocking thread.
pub fn sweep_archives(
    directory: &Path,
    base: &str,
    ext: &str,
    older_than_days: u32,
    zip_date: &str,
    now: SystemTime,
) -> Result<usize> {
    let cutoff = now
        .checked_sub(Duration::from_secs(u64::from(older_than_days) * 86_400))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let prefix = format!("{base}.");
    let _sweeping = SWEEP_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(directory).with_context(|| format!("list {}", directory.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(ext) || !name.contains(".#") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if modified < cutoff {
            candidates.push((name, entry.path()));
        }
    }
    if candidates.is_empty() {
        return Ok(0);
    }
    candidates.sort();

    let zip_path = directory.join(format!("{base}.{zip_date}.zip"));
    let mut writer = if zip_path.exists() {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&zip_path)
            .with_context(|| format!("open {}", zip_path.display()))?;
        ZipWriter::new_append(file)?
    } else {
        let file = std::fs::File::create(&zip_path)
            .with_context(|| format!("create {}", zip_path.display()))?;
        ZipWriter::new(file)
    };

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, path) in &candidates {
        writer.start_file(name.as_str(), options)?;
        let mut source = BufReader::new(std::fs::File::open(path)?);
        std::io::copy(&mut source, &mut writer)?;
    }
    writer.finish()?;

    for (_, path) in &candidates {
        std::fs::remove_file(path).with_context(|| format!("delete {}", path.display()))?;
    }
    Ok(candidates.len())
}

/// Wall-clock delay until the next occurrence of `at`
pub(crate) fn until_next(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let today = now.date().and_time(at);
    let target = if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    };
    (target - now).to_std().unwrap_or_default()
}

async fn auto_roll(stream: Arc<ArchivedStream>, at: NaiveTime, stop: CancellationToken) {
    loop {
        let wait = until_next(stream.ctx.clock.now(), at);
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        stream.timer_fired().await;
    }
}

pub(crate) async fn run<R: AsyncRead + Unpin>(
    reader: R,
    ctx: &StreamContext,
    settings: ArchivedSettings,
) -> Result<u64> {
    let stream = Arc::new(ArchivedStream::open(ctx.clone(), settings).await?);
    let timer_stop = ctx.shutdown.child_token();
    let _stop_timer = timer_stop.clone().drop_guard();
    if let Some(at) = stream.settings.auto_roll_at_time {
        tokio::spawn(auto_roll(stream.clone(), at, timer_stop));
    }

    let mut copier = StreamCopier::new(reader);
    let mut total = 0u64;
    loop {
        let starts_line = copier.at_line_boundary();
        let Some(chunk) = copier.next_unit().await? else {
            break;
        };
        stream.write(&chunk, starts_line).await?;
        total += chunk.len() as u64;
    }
    Ok(total)
}
