//! Redis backend.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tracing::debug;

use super::{BackendConnection, BackendResult, Connection, Connector};

/// Dials Redis with multiplexed tokio connections.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: Client,
}

impl RedisConnector {
    /// Create a connector for `redis://host:port/db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid. No connection is made.
    pub fn new(url: &str) -> BackendResult<Self> {
        Ok(Self {
            client: Client::open(url)?,
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> BackendResult<Connection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Opened redis connection");
        Ok(Box::new(RedisConnection { conn }))
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<BoxStream<'static, Vec<u8>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }
}

/// One multiplexed Redis connection.
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl BackendConnection for RedisConnection {
    async fn ping(&mut self) -> BackendResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn hash_incr(&mut self, key: &str, field: &str, delta: i64) -> BackendResult<i64> {
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut self.conn)
            .await?;
        Ok(value)
    }

    async fn hash_del(&mut self, key: &str, field: &str) -> BackendResult<()> {
        let _: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn hash_len(&mut self, key: &str) -> BackendResult<i64> {
        let len: i64 = redis::cmd("HLEN").arg(key).query_async(&mut self.conn).await?;
        Ok(len)
    }

    async fn hash_keys(&mut self, key: &str) -> BackendResult<Vec<String>> {
        let keys: Vec<String> = redis::cmd("HKEYS").arg(key).query_async(&mut self.conn).await?;
        Ok(keys)
    }

    async fn presence_add(
        &mut self,
        key: &str,
        member: &str,
        score: i64,
        expire_at: i64,
    ) -> BackendResult<()> {
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("EXPIREAT")
            .arg(key)
            .arg(expire_at)
            .ignore()
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn sorted_remove(&mut self, key: &str, member: &str) -> BackendResult<()> {
        let _: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn sorted_range_by_score(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
    ) -> BackendResult<Vec<String>> {
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut self.conn)
            .await?;
        Ok(members)
    }

    async fn publish(&mut self, channel: &str, payload: &[u8]) -> BackendResult<()> {
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn list_push(&mut self, key: &str, payload: &[u8]) -> BackendResult<()> {
        let _: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(payload)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn list_pop(&mut self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let payload: Option<Vec<u8>> = redis::cmd("LPOP").arg(key).query_async(&mut self.conn).await?;
        Ok(payload)
    }

    async fn ttl(&mut self, key: &str) -> BackendResult<i64> {
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut self.conn).await?;
        Ok(ttl)
    }

    async fn set_with_expiry(
        &mut self,
        key: &str,
        value: &str,
        seconds: u64,
    ) -> BackendResult<()> {
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(seconds)
            .arg(value)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> BackendResult<()> {
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut self.conn).await?;
        Ok(())
    }
}
