//! Bounded polling helpers.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::host::Host;
use crate::metrics;

/// Run `attempt` until it returns true or `max_attempts` runs are used up.
///
/// The first attempt runs immediately; every further attempt is preceded by
/// a sleep of `interval`. The attempt number (starting at 1) is passed in.
/// Exhaustion is reported as `false`, never as an error.
pub async fn run_with_retry<F>(
    operation: &str,
    max_attempts: u32,
    interval: Duration,
    mut attempt: F,
) -> bool
where
    F: AsyncFnMut(u32) -> bool,
{
    if attempt(1).await {
        return true;
    }
    for n in 2..=max_attempts {
        debug!(operation, attempt = n, max_attempts, "Retrying");
        metrics::record_retry(operation);
        tokio::time::sleep(interval).await;
        if attempt(n).await {
            return true;
        }
    }
    false
}

/// Wait for `path` to exist.
pub async fn wait_for_path<H: Host>(
    host: &H,
    path: &Path,
    attempts: u32,
    interval: Duration,
) -> bool {
    run_with_retry("wait_for_path", attempts, interval, async |_| {
        host.path_exists(path)
    })
    .await
}
