//! Fixed-interval status polling.

use crate::orchestrator::Orchestrator;
use log::{debug, error, info};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Refresh `orchestrator` every `interval` until `shutdown` is cancelled.
///
/// Refresh errors are logged and polling continues.
pub fn spawn_polling(
    orchestrator: Orchestrator,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Status polling every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match orchestrator.refresh().await {
                Ok(snapshot) => debug!(
                    "{} (camera trigger {:?}, obstime {})",
                    snapshot.state,
                    snapshot.camera_trigger,
                    orchestrator.observation_time_string().await
                ),
                Err(e) => error!("Status refresh failed: {}", e),
            }
        }
        info!("Status polling stopped");
    })
}
