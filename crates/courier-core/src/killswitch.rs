//! Long-poll kill-switch.
//!
//! A TTL key in the shared backend turns long-polling off cluster-wide for a
//! while. Each process polls the key and mirrors it into
//! [`FeatureFlags::longpoll_disabled`].

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::KillswitchConfig;
use crate::flags::FeatureFlags;
use crate::queue::{CommandQueue, QueueError};

/// Reads and writes the kill-switch key.
pub struct Killswitch {
    queue: Arc<CommandQueue>,
    key: String,
}

impl Killswitch {
    #[must_use]
    pub fn new(queue: Arc<CommandQueue>, config: &KillswitchConfig) -> Self {
        Self {
            queue,
            key: config.key.clone(),
        }
    }

    /// Whether the key exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend did not answer in time.
    pub async fn is_active(&self) -> Result<bool, QueueError> {
        let key = self.key.clone();
        let ttl = self
            .queue
            .run(move |conn| Box::pin(async move { conn.ttl(&key).await }))
            .await?;
        // -2: no such key; -1: no expiry
        Ok(ttl >= -1)
    }

    /// Disable long-polling for `seconds`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend did not confirm in time.
    pub async fn activate(&self, seconds: u64) -> Result<(), QueueError> {
        let key = self.key.clone();
        self.queue
            .run(move |conn| Box::pin(async move { conn.set_with_expiry(&key, "1", seconds).await }))
            .await?;
        info!(seconds, "Long-poll kill-switch activated");
        Ok(())
    }

    /// Re-enable long-polling.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend did not confirm in time.
    pub async fn deactivate(&self) -> Result<(), QueueError> {
        let key = self.key.clone();
        self.queue
            .run(move |conn| Box::pin(async move { conn.delete(&key).await }))
            .await?;
        info!("Long-poll kill-switch deactivated");
        Ok(())
    }

    /// Poll the key every `interval` and store the answer in `flags`.
    ///
    /// An unanswered poll leaves the flag unchanged.
    #[must_use]
    pub fn spawn_monitor(
        self: &Arc<Self>,
        flags: Arc<FeatureFlags>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let switch = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match switch.is_active().await {
                    Ok(active) => {
                        if flags.longpoll_disabled() != active {
                            info!(active, "Long-poll kill-switch changed");
                        }
                        flags.set_longpoll_disabled(active);
                    }
                    Err(e) => warn!(error = %e, "Kill-switch poll failed"),
                }
            }
        })
    }
}
