use std::sync::Arc;
use std::time::Duration;

use chorus_core::AppState;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Periodically delete idle empty rooms and expired guests until `shutdown`
/// is notified. The first pass runs one interval after startup.
pub fn spawn_maintenance(
    state: AppState,
    every: Duration,
    room_idle: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = interval.tick() => {
                    match state.run_maintenance(room_idle).await {
                        Ok((rooms, guests)) => {
                            tracing::debug!(rooms, guests, "maintenance pass finished");
                        }
                        Err(e) => tracing::warn!("Maintenance pass failed: {}", e),
                    }
                }
            }
        }
        tracing::info!("maintenance scheduler stopped");
    })
}
