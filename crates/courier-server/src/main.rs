//! # courier
//!
//! Realtime fan-out server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (standalone, no redis)
//! courier
//!
//! # Run with a custom config file
//! COURIER_CONFIG=/path/to/courier.toml courier
//!
//! # Override single settings
//! COURIER__PORT=8080 COURIER__REDIS__ENABLED=true courier
//! ```

use anyhow::Result;
use courier_server::config::Config;
use courier_server::handlers::{self, AppState};
use courier_server::stats;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;

    info!("Starting courier on {}:{}", config.host, config.port);

    // Initialize metrics
    if config.metrics.enabled {
        courier_server::metrics::init_metrics();
        if let Err(e) = courier_server::metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let stats_config = config.stats.clone();
    let state = Arc::new(AppState::new(config)?);
    let hub = Arc::clone(&state.hub);
    let reporters = stats::spawn_reporters(Arc::clone(&hub), &stats_config);

    let signal_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, courier is going down");
        signal_hub.shutdown();
    });

    // Start the server
    let result = handlers::run_server(state).await;

    hub.shutdown();
    for reporter in reporters {
        reporter.abort();
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
