//! Age-based retention sweep.
//!
//! Runs once at startup and then hourly. Best-effort: a failed sweep is
//! logged and retried at the next tick, never sooner.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use forked_core::now_ms;
use forked_settings::Retention;
use forked_store::TraceStore;

/// Interval between sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Spawn the retention sweeper task.
///
/// With retention disabled the task exits immediately.
pub fn spawn_sweeper(
    store: Arc<TraceStore>,
    retention: Retention,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(days) = retention.days() else {
            debug!("retention disabled, sweeper idle");
            return;
        };

        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                // First tick fires immediately: sweep once at startup.
                _ = ticker.tick() => {
                    if let Err(e) = store.delete_older_than(days, now_ms()) {
                        warn!(error = %e, "retention sweep failed");
                    }
                }
            }
        }
    })
}
