// Periodic clean-up of rows that can no longer matter.
use crate::backend::SqliteBackend;
use crate::clock::Clock;
use crate::rate_limiter::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

// What a single purge pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    // Rate-limit attempts older than every window.
    pub attempts: u64,
    // Notifications past `expires_at`.
    pub notifications: u64,
}

// Physically drops attempts that can no longer fall inside any window, and
// notifications past their expiry.
pub async fn purge_once(limiter: &RateLimiter, backend: &SqliteBackend, clock: &dyn Clock) -> PurgeReport {
    // Times the pass for the log line.
    let start = std::time::Instant::now();
    // Both cut-offs come from the injected clock so tests can move time.
    let now = clock.now_ms();
    let mut report = PurgeReport::default();

    // An attempt older than the longest window is never counted again.
    match limiter.store().purge_before(now - limiter.longest_window_ms()).await {
        Ok(n) => report.attempts = n,
        // A failed purge is logged and retried on the next tick.
        Err(e) => error!("Purge of rate-limit attempts failed: {}", e),
    }
    // Expired notifications are filtered out of reads already; this reclaims the rows.
    match backend.purge_expired_notifications(now).await {
        Ok(n) => report.notifications = n,
        Err(e) => error!("Purge of expired notifications failed: {}", e),
    }

    // Only passes that removed something are worth a log line.
    if report.attempts + report.notifications > 0 {
        info!(
            "Purge finished: {} attempts, {} notifications removed in {:?}",
            report.attempts,
            report.notifications,
            start.elapsed()
        );
    }
    report
}

// Runs `purge_once` every `every` on a background task until the handle is aborted.
pub fn spawn_purge_worker(
    limiter: RateLimiter,
    backend: SqliteBackend,
    clock: Arc<dyn Clock>,
    every: Duration,
) -> JoinHandle<()> {
    // The task owns its handles; all of them are cheap clones of shared state.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; skip it so start-up does not purge.
        interval.tick().await;
        loop {
            // Waits for the next period.
            interval.tick().await;
            // The report is already logged inside.
            purge_once(&limiter, &backend, clock.as_ref()).await;
        }
    })
}
