//! Periodic liveness probing of broker endpoints

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::BrokerRegistry;

/// Probe all endpoints every `interval` until cancelled
pub async fn run_liveness(
    registry: Arc<BrokerRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Liveness loop stopped");
                break;
            }
            _ = ticker.tick() => {
                registry.probe_all().await;
            }
        }
    }
}
