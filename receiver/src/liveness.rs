use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::ACTIVE_DEVICES;
use crate::registry::DeviceRegistry;

/// Periodic sweep marking silent devices inactive.
///
/// This task is the only place the Active -> Inactive transition happens;
/// `upsert` handles the way back on the next accepted event.
pub async fn run_monitor(
    registry: DeviceRegistry,
    timeout: Duration,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        "Starting liveness monitor with timeout={:?}, interval={:?}",
        timeout, sweep_interval
    );

    let mut ticker = interval(sweep_interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let flipped = registry.sweep_inactive(timeout, Utc::now()).await;
                if flipped > 0 {
                    info!("Marked {} device(s) inactive", flipped);
                } else {
                    debug!("Liveness sweep found no silent devices");
                }
                ACTIVE_DEVICES.set(registry.active_count().await as f64);
            }
        }
    }

    info!("Liveness monitor stopped");
}
