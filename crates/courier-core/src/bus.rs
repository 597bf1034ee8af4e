//! The shared bus.
//!
//! Commands cross process boundaries two ways: a pub/sub channel and a
//! durable list polled with `LPOP`. Both feed one decode task, which hands
//! every valid envelope to [`Router::dispatch_bus`]. Neither loop ever
//! exits on a backend error; they log, back off and retry.

use courier_protocol::{decode_envelope, encode_envelope, Envelope, ProtocolError};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backend::{BackendError, BackendResult};
use crate::config::BusConfig;
use crate::pool::Pool;
use crate::router::Router;
use crate::telemetry::SharedTelemetry;

/// Payloads buffered between the listeners and the decode task.
const INBOUND_CAPACITY: usize = 10_000;

/// Publishes to and listens on the shared bus.
pub struct Bus {
    pool: Pool,
    config: BusConfig,
    timeout: Duration,
    telemetry: SharedTelemetry,
}

impl Bus {
    #[must_use]
    pub fn new(pool: Pool, config: BusConfig, timeout: Duration, telemetry: SharedTelemetry) -> Self {
        Self {
            pool,
            config,
            timeout,
            telemetry,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    async fn bounded<T>(&self, call: impl Future<Output = BackendResult<T>>) -> BackendResult<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or(Err(BackendError::Timeout))
    }

    /// Publish an envelope on the bus channel, to be routed by every
    /// process.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope could not be encoded or published.
    pub async fn publish(&self, envelope: &Envelope) -> BackendResult<()> {
        let payload = encode_envelope(envelope)?;
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            conn.publish(&self.config.channel, &payload).await
        })
        .await
    }

    /// Append an envelope to the durable bus queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope could not be encoded or pushed.
    pub async fn enqueue(&self, envelope: &Envelope) -> BackendResult<()> {
        let payload = encode_envelope(envelope)?;
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            conn.list_push(&self.config.queue, &payload).await
        })
        .await
    }

    /// Record failed Android deliveries on the error queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the report could not be pushed.
    pub async fn push_android_failure(
        &self,
        registration_ids: &[String],
        results: &[Value],
    ) -> BackendResult<()> {
        let payload = serde_json::to_vec(&json!({
            "registration_ids": registration_ids,
            "results": results,
        }))
        .map_err(ProtocolError::from)?;

        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            conn.list_push(&self.config.android_error_queue, &payload).await
        })
        .await
    }

    async fn pop(&self) -> BackendResult<Option<Vec<u8>>> {
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            conn.list_pop(&self.config.queue).await
        })
        .await
    }

    /// Start the subscriber, the queue poller and the decode task.
    ///
    /// Must be called from within a tokio runtime. The tasks run until
    /// their handles are aborted.
    #[must_use]
    pub fn spawn_listeners(self: &Arc<Self>, router: Arc<Router>) -> Vec<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        info!(
            channel = %self.config.channel,
            queue = %self.config.queue,
            "Bus listeners starting"
        );

        vec![
            tokio::spawn(Arc::clone(self).subscribe_loop(tx.clone())),
            tokio::spawn(Arc::clone(self).poll_loop(tx)),
            tokio::spawn(Arc::clone(self).decode_loop(rx, router)),
        ]
    }

    async fn subscribe_loop(self: Arc<Self>, tx: mpsc::Sender<Vec<u8>>) {
        loop {
            match self.pool.connector().subscribe(&self.config.channel).await {
                Ok(mut stream) => {
                    debug!(channel = %self.config.channel, "Subscribed");
                    while let Some(payload) = stream.next().await {
                        if tx.send(payload).await.is_err() {
                            return;
                        }
                    }
                    warn!(channel = %self.config.channel, "Subscription ended, resubscribing");
                }
                Err(e) => {
                    warn!(channel = %self.config.channel, error = %e, "Subscribe failed");
                }
            }
            tokio::time::sleep(self.config.resubscribe_backoff).await;
        }
    }

    async fn poll_loop(self: Arc<Self>, tx: mpsc::Sender<Vec<u8>>) {
        loop {
            match self.pop().await {
                Ok(Some(payload)) => {
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    warn!(queue = %self.config.queue, error = %e, "Queue poll failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn decode_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>, router: Arc<Router>) {
        while let Some(payload) = rx.recv().await {
            match decode_envelope(&payload) {
                Ok(envelope) => {
                    trace!(command = ?envelope.command_name(), "Bus command");
                    router.dispatch_bus(envelope).await;
                }
                Err(e) => {
                    self.telemetry.invalid_json();
                    warn!(error = %e, "Skipping undecodable bus payload");
                }
            }
        }
    }
}
