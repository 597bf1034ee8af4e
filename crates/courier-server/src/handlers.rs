//! HTTP handlers for the courier server.
//!
//! Routes:
//! - `/socket`: WebSocket sessions
//! - `/lp`: long-poll requests (query or form parameters `user`, `page`, `command`)
//! - `/ping`: liveness probe
//! - `/health`: JSON status

use crate::config::Config;
use crate::metrics::PrometheusTelemetry;
use crate::push::{LoggingAndroid, LoggingIos};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Form, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use courier_core::{
    serve_long_poll, serve_stream, BackendRole, Hub, HubBuilder, LongPollOutcome,
    LongPollRequest, MemoryBackend, NoopTelemetry, RedisConnector, SystemClock,
};
use courier_transport::{longpoll, websocket, WebSocketConfig};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Headers on every long-poll response.
fn long_poll_headers() -> [(header::HeaderName, &'static str); 2] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (
            header::CACHE_CONTROL,
            "private, no-store, no-cache, must-revalidate",
        ),
    ]
}

/// Shared server state.
pub struct AppState {
    /// The hub every connection is attached to.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    websocket: WebSocketConfig,
}

impl AppState {
    /// Build the hub described by `config`.
    ///
    /// With Redis enabled the backend is shared with every other process;
    /// otherwise an in-process backend keeps presence and nothing else.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis URL is invalid or no runtime is running.
    pub fn new(config: Config) -> Result<Self> {
        let mut builder = HubBuilder::new(config.hub_config());

        builder = if config.metrics.enabled {
            builder.telemetry(Arc::new(PrometheusTelemetry))
        } else {
            builder.telemetry(Arc::new(NoopTelemetry))
        };

        builder = if config.redis.enabled {
            let connector = RedisConnector::new(&config.redis.url)
                .with_context(|| format!("Invalid redis url: {}", config.redis.url))?;
            info!(url = %config.redis.url, "Using shared redis backend");
            builder.backend(Arc::new(connector), BackendRole::Shared)
        } else {
            info!("Redis disabled, running standalone");
            let backend = MemoryBackend::new(Arc::new(SystemClock));
            builder.backend(Arc::new(backend), BackendRole::PresenceOnly)
        };

        if config.push.apns_enabled {
            builder = builder.ios(Arc::new(LoggingIos));
        }
        if config.push.gcm_enabled {
            builder = builder.android(Arc::new(LoggingAndroid));
        }

        let hub = builder.build()?;
        Ok(Self::with_hub(config, hub))
    }

    /// Serve an already assembled hub.
    #[must_use]
    pub fn with_hub(config: Config, hub: Arc<Hub>) -> Self {
        Self {
            hub,
            websocket: config.websocket_config(),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.websocket.path.clone();
    let lp_path = state.config.long_poll.path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route(&lp_path, get(long_poll_handler).post(long_poll_handler))
        .route("/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until the hub shuts down.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("courier listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}, long-poll endpoint: http://{}{}",
        addr, state.config.websocket.path, addr, state.config.long_poll.path
    );

    serve(listener, state).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let hub = Arc::clone(&state.hub);
    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { hub.wait_for_shutdown().await })
        .await?;

    Ok(())
}

/// Liveness probe.
async fn ping_handler() -> &'static str {
    "OK"
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.hub.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.hub.client_count().await,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.hub.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(state.websocket.max_message_size)
        .on_upgrade(move |socket| async move {
            let (reader, writer) = websocket::split(socket, &state.websocket);
            serve_stream(Arc::clone(&state.hub), reader, writer).await;
        })
}

/// Long-poll parameters.
#[derive(Debug, Default, Deserialize)]
pub struct LongPollParams {
    pub user: Option<String>,
    pub page: Option<String>,
    /// A JSON command envelope.
    pub command: Option<String>,
}

/// Long-poll handler. Answers with the first message delivered, or an empty
/// status once the request ends without one.
async fn long_poll_handler(
    State(state): State<Arc<AppState>>,
    Form(params): Form<LongPollParams>,
) -> Response {
    let request = LongPollRequest {
        user: params.user.unwrap_or_default(),
        page: params.page,
        command: params.command,
    };
    let (writer, mut response) = longpoll::channel();

    // Runs to completion even if the client goes away, so the socket is
    // always deregistered.
    let task = tokio::spawn(serve_long_poll(Arc::clone(&state.hub), request, writer));
    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Long-poll task failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    debug!(?outcome, "Long-poll response");

    match outcome {
        LongPollOutcome::Delivered => match response.recv().await {
            Some(message) => (StatusCode::OK, long_poll_headers(), Json(message)).into_response(),
            None => (StatusCode::NO_CONTENT, long_poll_headers()).into_response(),
        },
        LongPollOutcome::TimedOut | LongPollOutcome::Disconnected => {
            (StatusCode::NO_CONTENT, long_poll_headers()).into_response()
        }
        LongPollOutcome::Shutdown | LongPollOutcome::Disabled => (
            StatusCode::SERVICE_UNAVAILABLE,
            long_poll_headers(),
            [(header::CONNECTION, "close")],
        )
            .into_response(),
        LongPollOutcome::Rejected => (StatusCode::BAD_REQUEST, long_poll_headers()).into_response(),
    }
}
