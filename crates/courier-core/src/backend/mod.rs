//! Shared backend abstraction.
//!
//! Everything the hub stores outside the process goes through
//! [`BackendConnection`]: the registry mirror, presence sets, the bus and the
//! long-poll kill-switch. [`Connector`] dials connections for the pool and
//! opens dedicated subscription streams.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisConnector;

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Redis reported an error.
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A direct call exceeded its deadline.
    #[error("Backend call timed out")]
    Timeout,

    /// A payload could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(#[from] courier_protocol::ProtocolError),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A pooled connection as handed to queued commands.
pub type Connection = Box<dyn BackendConnection>;

/// Commands the hub issues against the shared backend.
#[async_trait]
pub trait BackendConnection: Send {
    /// Liveness probe.
    async fn ping(&mut self) -> BackendResult<()>;

    /// `HINCRBY`. Returns the new value.
    async fn hash_incr(&mut self, key: &str, field: &str, delta: i64) -> BackendResult<i64>;

    /// `HDEL`.
    async fn hash_del(&mut self, key: &str, field: &str) -> BackendResult<()>;

    /// `HLEN`.
    async fn hash_len(&mut self, key: &str) -> BackendResult<i64>;

    /// `HKEYS`.
    async fn hash_keys(&mut self, key: &str) -> BackendResult<Vec<String>>;

    /// `ZADD key score member` and `EXPIREAT key expire_at`, atomically.
    async fn presence_add(
        &mut self,
        key: &str,
        member: &str,
        score: i64,
        expire_at: i64,
    ) -> BackendResult<()>;

    /// `ZREM`.
    async fn sorted_remove(&mut self, key: &str, member: &str) -> BackendResult<()>;

    /// `ZRANGEBYSCORE key min max`, inclusive.
    async fn sorted_range_by_score(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
    ) -> BackendResult<Vec<String>>;

    /// `PUBLISH`.
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> BackendResult<()>;

    /// `RPUSH`.
    async fn list_push(&mut self, key: &str, payload: &[u8]) -> BackendResult<()>;

    /// `LPOP`.
    async fn list_pop(&mut self, key: &str) -> BackendResult<Option<Vec<u8>>>;

    /// `TTL`: `-2` if the key is missing, `-1` if it has no expiry.
    async fn ttl(&mut self, key: &str) -> BackendResult<i64>;

    /// `SETEX`.
    async fn set_with_expiry(&mut self, key: &str, value: &str, seconds: u64)
        -> BackendResult<()>;

    /// `DEL`.
    async fn delete(&mut self, key: &str) -> BackendResult<()>;
}

/// Dials backend connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new command connection.
    async fn connect(&self) -> BackendResult<Connection>;

    /// Subscribe to a pub/sub channel on a dedicated connection.
    ///
    /// The stream ends when the subscription is lost.
    async fn subscribe(&self, channel: &str) -> BackendResult<BoxStream<'static, Vec<u8>>>;
}
