use super::StreamContext;
use super::files::{exists, open_append, open_truncate, rename};
use crate::copier::StreamCopier;
use anyhow::Result;
use std::path::PathBuf;
use tokio::io::AsyncRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMode {
    Append,
    Truncate,
    RollOnce,
}

/// Copy into a single file that never rotates once opened
pub(crate) async fn run<R: AsyncRead + Unpin>(
    reader: R,
    ctx: &StreamContext,
    mode: OpenMode,
) -> Result<u64> {
    let path = ctx.active_path();

    let mut file = match mode {
        OpenMode::Append => open_append(&path).await?,
        OpenMode::Truncate => open_truncate(&path).await?,
        OpenMode::RollOnce => {
            if exists(&path).await {
                let mut old = path.clone().into_os_string();
                old.push(".old");
                let old = PathBuf::from(old);
                if let Err(e) = rename(&path, &old).await {
                    ctx.report(format!("Failed to roll previous log: {e:#}"));
                }
            }
            open_append(&path).await?
        }
    };

    let mut copier = StreamCopier::new(reader);
    Ok(copier.drain_to(&mut file).await?)
}
