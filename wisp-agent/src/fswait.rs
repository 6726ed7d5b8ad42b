//! Polling waits for socket files.
//!
//! gpg-agent creates and removes its pseudo-socket files asynchronously;
//! both waits poll on a one-second tick for a bounded period.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{Instant, interval};
use tracing::debug;

async fn is_file(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file())
}

/// Wait until every path exists as a regular file.  Returns `false` when the
/// period runs out first.
pub async fn wait_for_file_arrival(period: Duration, paths: &[PathBuf]) -> bool {
    let mut pending: Vec<&PathBuf> = paths.iter().collect();
    let deadline = Instant::now() + period;
    let mut tick = interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        let mut still_missing = Vec::new();
        for path in pending {
            if !is_file(path).await {
                still_missing.push(path);
            }
        }
        pending = still_missing;
        if pending.is_empty() {
            return true;
        }
        if Instant::now() >= deadline {
            debug!(missing = pending.len(), "files did not arrive in time");
            return false;
        }
    }
}

/// Try to remove every path until all are gone or the period runs out.
/// Removal failures are retried on the next tick.
pub async fn wait_for_file_departure(period: Duration, paths: &[PathBuf]) {
    let mut pending: Vec<&PathBuf> = paths.iter().collect();
    let deadline = Instant::now() + period;
    let mut tick = interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        let mut remaining = Vec::new();
        for path in pending {
            if !is_file(path).await {
                continue;
            }
            if let Err(err) = tokio::fs::remove_file(path).await {
                debug!(path = %path.display(), "cannot remove departing file: {err}");
                remaining.push(path);
            }
        }
        pending = remaining;
        if pending.is_empty() || Instant::now() >= deadline {
            return;
        }
    }
}
