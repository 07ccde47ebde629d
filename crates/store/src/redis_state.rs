//! Redis adapter for the shared-state port: cooldown claims plus the
//! set/zset/list/stream primitives the reconciliation workers inspect.

use async_trait::async_trait;
use redis::streams::{StreamPendingCountReply, StreamRangeReply};
use redis::AsyncCommands;

use pulse_core::config::RedisConfig;
use pulse_core::ports::{PendingEntry, SharedState, StreamEntry};

/// Field name used for stream payloads.
const STREAM_FIELD: &str = "data";

pub struct RedisSharedState {
    client: redis::Client,
}

impl RedisSharedState {
    pub fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(config.url.as_str())?,
        })
    }

    async fn conn(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl SharedState for RedisSharedState {
    async fn claim(&self, key: &str, ttl_secs: u64) -> anyhow::Result<bool> {
        let mut conn = self.conn().await?;
        // SET NX EX is the atomic claim; a nil reply means someone else
        // holds it.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_size(&self, key: &str) -> anyhow::Result<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.scard(key).await?)
    }

    async fn zset_members(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.zrange(key, 0, -1).await?)
    }

    async fn zset_remove(&self, key: &str, members: &[String]) -> anyhow::Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.zrem(key, members).await?)
    }

    async fn list_len(&self, key: &str) -> anyhow::Result<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(key).await?)
    }

    async fn list_sample(&self, key: &str, count: usize) -> anyhow::Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        Ok(conn.lrange(key, 0, count as isize - 1).await?)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn stream_append(&self, key: &str, payload: &str) -> anyhow::Result<String> {
        let mut conn = self.conn().await?;
        Ok(conn.xadd(key, "*", &[(STREAM_FIELD, payload)]).await?)
    }

    async fn stream_len(&self, key: &str) -> anyhow::Result<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.xlen(key).await?)
    }

    async fn stream_range(
        &self,
        key: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> anyhow::Result<Vec<StreamEntry>> {
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = conn.xrange_count(key, start, end, count).await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|entry| StreamEntry {
                payload: entry.get::<String>(STREAM_FIELD).unwrap_or_default(),
                id: entry.id,
            })
            .collect())
    }

    async fn stream_delete(&self, key: &str, ids: &[String]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.xdel(key, ids).await?)
    }

    async fn pending(&self, key: &str, group: &str) -> anyhow::Result<Vec<PendingEntry>> {
        let mut conn = self.conn().await?;
        let reply: StreamPendingCountReply =
            conn.xpending_count(key, group, "-", "+", 100).await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|entry| PendingEntry {
                id: entry.id,
                consumer: entry.consumer,
                idle_ms: entry.last_delivered_ms as u64,
            })
            .collect())
    }
}
