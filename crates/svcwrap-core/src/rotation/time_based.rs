use super::StreamContext;
use super::files::open_append;
use super::pattern::{DatePattern, RollSchedule, detect_periodicity};
use crate::copier::{StreamCopier, write_unit};
use anyhow::Result;
use chrono::NaiveDateTime;
use std::path::PathBuf;
use tokio::io::AsyncRead;
use tracing::debug;

fn dated_path(ctx: &StreamContext, pattern: &DatePattern, at: &NaiveDateTime) -> PathBuf {
    ctx.path_with_infix(&format!(".{}", pattern.format(at)))
}

/// Copy into `<base>.<timestamp><ext>`, opening a new file each period
pub(crate) async fn run<R: AsyncRead + Unpin>(
    reader: R,
    ctx: &StreamContext,
    pattern: &str,
    period: u32,
) -> Result<u64> {
    let unit = detect_periodicity(pattern)?;
    let pattern = DatePattern::parse(pattern);
    let now = ctx.clock.now();
    let mut schedule = RollSchedule::new(unit, period, now);
    let mut file = open_append(&dated_path(ctx, &pattern, &now)).await?;

    let mut copier = StreamCopier::new(reader);
    let mut total = 0u64;

    loop {
        let starts_line = copier.at_line_boundary();
        let Some(chunk) = copier.next_unit().await? else {
            break;
        };

        if starts_line {
            let now = ctx.clock.now();
            if schedule.is_due(now) {
                let next_path = dated_path(ctx, &pattern, &now);
                match open_append(&next_path).await {
                    Ok(next) => {
                        debug!(path = %next_path.display(), "Rolled time-based log");
                        file = next;
                    }
                    Err(e) => ctx.report(format!("Failed to roll time-based log: {e:#}")),
                }
                schedule.advance(now);
            }
        }

        write_unit(&mut file, &chunk).await?;
        total += chunk.len() as u64;
    }
    Ok(total)
}
