//! Connection pool health check task.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::PoolInner;

/// Periodically expire entries past their TTL and prune unhealthy ones.
///
/// Holds only a weak reference, so it stops on its own once the pool is
/// dropped. Each sweep takes the state lock briefly to collect victims and
/// cancels their streams after releasing it, so it never blocks in-flight
/// acquires on upstream acknowledgements.
pub(super) async fn health_check_task(pool: Weak<PoolInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    debug!(interval_secs = interval.as_secs(), "Health check task started");

    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            debug!("Pool dropped, health check exiting");
            return;
        };
        inner.sweep().await;
    }
}
