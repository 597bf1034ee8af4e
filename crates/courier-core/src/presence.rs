//! Presence tracking.
//!
//! A user is active while at least one of their connections has been marked
//! within the last presence duration. Marks live in a per-user sorted set
//! scored by timestamp, whose expiry is pushed forward on every mark, so an
//! abandoned user ages out without an explicit `mark_inactive`.
//!
//! All calls go through the [`CommandQueue`] with a uniform deadline and
//! never block routing for longer than that.

use std::sync::Arc;
use tracing::debug;

use crate::config::PresenceConfig;
use crate::queue::{CommandQueue, QueueError};

/// Marks and queries user activity.
pub struct PresenceTracker {
    queue: Arc<CommandQueue>,
    config: PresenceConfig,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(queue: Arc<CommandQueue>, config: PresenceConfig) -> Self {
        Self { queue, config }
    }

    fn key(&self, user: &str) -> String {
        format!("{}:{}", self.config.key_prefix, user)
    }

    fn duration_secs(&self) -> i64 {
        self.config.duration.as_secs() as i64
    }

    /// Mark `connection_id` of `user` active at `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend did not confirm in time.
    pub async fn mark_active(
        &self,
        user: &str,
        connection_id: &str,
        timestamp: i64,
    ) -> Result<(), QueueError> {
        let key = self.key(user);
        let member = connection_id.to_string();
        let expire_at = timestamp + self.duration_secs();

        debug!(user = %user, connection = %connection_id, "Marking active");
        self.queue
            .run_with_timeout(self.config.timeout, move |conn| {
                Box::pin(async move { conn.presence_add(&key, &member, timestamp, expire_at).await })
            })
            .await
    }

    /// Remove the mark for `connection_id` of `user`. The set's expiry is
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend did not confirm in time.
    pub async fn mark_inactive(&self, user: &str, connection_id: &str) -> Result<(), QueueError> {
        let key = self.key(user);
        let member = connection_id.to_string();

        debug!(user = %user, connection = %connection_id, "Marking inactive");
        self.queue
            .run_with_timeout(self.config.timeout, move |conn| {
                Box::pin(async move { conn.sorted_remove(&key, &member).await })
            })
            .await
    }

    /// Whether any connection of `user` was marked within the presence
    /// duration before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the answer is unknown; callers decide the
    /// fallback.
    pub async fn is_active(&self, user: &str, now: i64) -> Result<bool, QueueError> {
        let key = self.key(user);
        let since = now - self.duration_secs();

        self.queue
            .run_with_timeout(self.config.timeout, move |conn| {
                Box::pin(async move {
                    let members = conn.sorted_range_by_score(&key, since, now).await?;
                    Ok(!members.is_empty())
                })
            })
            .await
    }
}
