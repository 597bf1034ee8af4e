//! Shared-backend copy of the registry.
//!
//! Each index is a hash of `key -> live connection count`. Increments and
//! decrements are direct backend calls bounded by a deadline; a field is
//! deleted once its count drops to zero, so `HLEN` is the number of distinct
//! keys with at least one connection anywhere in the cluster.

use std::future::Future;
use std::time::Duration;

use crate::backend::{BackendError, BackendResult};
use crate::config::MirrorConfig;
use crate::pool::Pool;

/// Which hash an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorIndex {
    Clients,
    Pages,
    Groups,
}

/// Writes registry membership to the shared backend.
#[derive(Clone)]
pub struct Mirror {
    pool: Pool,
    keys: MirrorConfig,
    timeout: Duration,
}

impl Mirror {
    #[must_use]
    pub fn new(pool: Pool, keys: MirrorConfig, timeout: Duration) -> Self {
        Self {
            pool,
            keys,
            timeout,
        }
    }

    fn key(&self, index: MirrorIndex) -> &str {
        match index {
            MirrorIndex::Clients => &self.keys.clients_key,
            MirrorIndex::Pages => &self.keys.pages_key,
            MirrorIndex::Groups => &self.keys.groups_key,
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = BackendResult<T>>) -> BackendResult<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or(Err(BackendError::Timeout))
    }

    /// Count one more connection under `field`.
    pub async fn incr(&self, index: MirrorIndex, field: &str) -> BackendResult<()> {
        let key = self.key(index);
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            conn.hash_incr(key, field, 1).await?;
            Ok(())
        })
        .await
    }

    /// Count one fewer connection under `field`, dropping it at zero.
    pub async fn decr(&self, index: MirrorIndex, field: &str) -> BackendResult<()> {
        let key = self.key(index);
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            if conn.hash_incr(key, field, -1).await? <= 0 {
                conn.hash_del(key, field).await?;
            }
            Ok(())
        })
        .await
    }

    /// Distinct identities connected anywhere.
    pub async fn count(&self) -> BackendResult<i64> {
        let key = self.key(MirrorIndex::Clients);
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            conn.hash_len(key).await
        })
        .await
    }

    /// Identities connected anywhere.
    pub async fn clients(&self) -> BackendResult<Vec<String>> {
        let key = self.key(MirrorIndex::Clients);
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            conn.hash_keys(key).await
        })
        .await
    }
}
