use super::StreamContext;
use super::files::{exists, file_len, open_append, open_truncate, remove_if_exists, rename};
use crate::copier::{StreamCopier, write_unit};
use anyhow::Result;
use std::path::Path;
use tokio::io::AsyncRead;

/// Copy with numbered backups `<base>.0<ext>` (newest) to `<base>.<keep-1><ext>`
pub(crate) async fn run<R: AsyncRead + Unpin>(
    reader: R,
    ctx: &StreamContext,
    threshold_bytes: u64,
    keep_files: u32,
) -> Result<u64> {
    let path = ctx.active_path();
    let mut size = file_len(&path).await;
    let mut file = open_append(&path).await?;
    let mut copier = StreamCopier::new(reader);
    let mut total = 0u64;

    while let Some(unit) = copier.next_unit().await? {
        write_unit(&mut file, &unit).await?;
        size += unit.len() as u64;
        total += unit.len() as u64;

        if size > threshold_bytes && copier.at_line_boundary() {
            drop(file);
            if let Err(e) = shift_backups(&ctx.directory, &ctx.base_name, &ctx.extension, keep_files).await {
                ctx.report(format!("Failed to roll size-based log: {e:#}"));
            }
            file = open_truncate(&path).await?;
            size = 0;
        }
    }
    Ok(total)
}

/// Shift `.N` backups up by one, dropping the oldest, and move the active file to `.0`
pub async fn shift_backups(directory: &Path, base: &str, ext: &str, keep_files: u32) -> Result<()> {
    let numbered = |n: u32| directory.join(format!("{base}.{n}{ext}"));

    for j in (1..=keep_files).rev() {
        let dst = numbered(j - 1);
        remove_if_exists(&dst).await?;
        if j >= 2 {
            let src = numbered(j - 2);
            if exists(&src).await {
                rename(&src, &dst).await?;
            }
        }
    }

    let active = directory.join(format!("{base}{ext}"));
    if exists(&active).await {
        rename(&active, &numbered(0)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemoryEventLogger;
    use crate::rotation::{StreamSide, SystemClock};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context(dir: &Path, ext: &str) -> StreamContext {
        StreamContext {
            directory: dir.to_path_buf(),
            base_name: "base".to_string(),
            extension: ext.to_string(),
            side: StreamSide::Out,
            events: Arc::new(MemoryEventLogger::new()),
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        }
    }

    fn lines(count: usize, width: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..count {
            let line = format!("{i:0>w$}\n", w = width - 1);
            out.extend_from_slice(line.as_bytes());
        }
        out
    }

    #[tokio::test]
    async fn test_threshold_scenario_leaves_exact_file_set() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), ".log");
        let input = lines(30, 100);
        assert_eq!(input.len(), 3000);

        run(&input[..], &ctx, 1024, 2).await.unwrap();

        let current = std::fs::read(dir.path().join("base.log")).unwrap();
        let first = std::fs::read(dir.path().join("base.0.log")).unwrap();
        let second = std::fs::read(dir.path().join("base.1.log")).unwrap();
        assert_eq!(current.len(), 800);
        assert_eq!(first.len(), 1100);
        assert_eq!(second.len(), 1100);
        assert!(!dir.path().join("base.2.log").exists());

        // Oldest backup first, active file last
        let joined = [second, first, current].concat();
        assert_eq!(joined, input);
        for file in ["base.log", "base.0.log", "base.1.log"] {
            let content = std::fs::read(dir.path().join(file)).unwrap();
            assert_eq!(content.last(), Some(&b'\n'), "{file} ends mid-line");
        }
    }

    #[tokio::test]
    async fn test_retention_keeps_newest_backups() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), ".out.log");
        // Each line exceeds the threshold: five lines, five rotations
        let mut input = Vec::new();
        for i in 0..5 {
            input.extend_from_slice(format!("rotation-{i}-{}\n", "x".repeat(20)).as_bytes());
        }

        run(&input[..], &ctx, 16, 3).await.unwrap();

        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert!(read("base.0.out.log").starts_with("rotation-4"));
        assert!(read("base.1.out.log").starts_with("rotation-3"));
        assert!(read("base.2.out.log").starts_with("rotation-2"));
        assert!(!dir.path().join("base.3.out.log").exists());
        assert_eq!(read("base.out.log"), "");
    }

    #[tokio::test]
    async fn test_partial_line_defers_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), ".log");
        let (mut writer, reader) = tokio::io::duplex(64);

        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { run(reader, &ctx, 4, 2).await }
        });

        use tokio::io::AsyncWriteExt;
        writer.write_all(b"abcdefgh").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        writer.write_all(b"ij\nk\n").await.unwrap();
        drop(writer);
        task.await.unwrap().unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("base.0.log")).unwrap(),
            "abcdefghij\n"
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("base.log")).unwrap(), "k\n");
        assert!(!dir.path().join("base.1.log").exists());
    }
}
