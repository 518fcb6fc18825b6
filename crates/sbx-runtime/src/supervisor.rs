//! Keepalive supervision: a periodic reaper that destroys sandboxes whose
//! deadline has passed and that have no running background job.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::SandboxManager;

/// Run the reaper until the process exits. Spawned once at service start.
pub async fn run(manager: Arc<SandboxManager>) {
    let interval =
        Duration::from_secs(manager.config().runtime.supervisor_interval_seconds.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let reaped = manager.reap_expired().await;
        if reaped > 0 {
            debug!(reaped, "supervisor tick");
        }
    }
}
