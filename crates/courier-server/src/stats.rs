//! Periodic stats reporting.

use crate::config::StatsConfig;
use courier_core::Hub;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Start the reporters: the client count and pending command gauges, and a
/// periodic log line of connected clients. Both stop when the hub shuts
/// down.
pub fn spawn_reporters(hub: Arc<Hub>, config: &StatsConfig) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(report_gauges(
            Arc::clone(&hub),
            Duration::from_millis(config.gauge_interval_ms),
        )),
        tokio::spawn(log_clients(
            hub,
            Duration::from_secs(config.log_interval_secs),
        )),
    ]
}

async fn report_gauges(hub: Arc<Hub>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = hub.wait_for_shutdown() => break,
            _ = ticker.tick() => {
                let telemetry = hub.telemetry();
                telemetry.client_count(hub.client_count().await);
                telemetry.pending_commands(hub.pending_commands());
            }
        }
    }
}

async fn log_clients(hub: Arc<Hub>, every: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = hub.wait_for_shutdown() => break,
            _ = ticker.tick() => {
                let local = hub.registry().local_count();
                let total = hub.client_count().await;
                info!(
                    local = local,
                    total = total,
                    "Connected clients"
                );
            }
        }
    }
}
