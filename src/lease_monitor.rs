// src/lease_monitor.rs
//
// =============================================================================
// WHIRR: LEASE MONITOR
// =============================================================================
//
// Background sweep that periodically requeues `running` jobs whose
// lease/heartbeat has expired. Runs as its own `tokio::spawn`ed task in
// the server process; a transient storage error is logged and skipped
// rather than bringing the server down, with the wait between sweeps
// backed off on consecutive failures so a persistently unreachable
// database isn't hammered at the normal sweep rate.

use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(600);

pub async fn run_lease_monitor(
    storage: Arc<dyn Storage>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        match storage.requeue_expired().await {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    log::info!("lease monitor requeued {} expired job(s)", jobs.len());
                }
                consecutive_failures = 0;
            }
            Err(e) => {
                consecutive_failures += 1;
                let backoff = interval
                    .saturating_mul(1 << consecutive_failures.min(5))
                    .min(MAX_BACKOFF);
                log::warn!(
                    "lease monitor sweep failed ({consecutive_failures} consecutive): {e}; backing off {backoff:?}"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;

    #[tokio::test]
    async fn monitor_stops_promptly_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(SqliteStorage::open(dir.path().join("whirr.db"), 120).unwrap());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_lease_monitor(storage, Duration::from_secs(60), rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("lease monitor should stop promptly on shutdown")
            .unwrap();
    }
}
