use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use crate::error::StoreError;
use crate::storage::Store;

const BLOCKING_SLICE: Duration = Duration::from_millis(250);

/// Redis-backed store shared by every relay process.
///
/// The ready and retry queues are Redis lists: `LPUSH` adds at the newest
/// end, `BRPOP`/`RPOP` take from the oldest end. Both are atomic on the
/// server, so concurrent workers never receive the same entry.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Open a managed connection that reconnects on failure.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn push(&self, list: &str, item: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: usize = conn.lpush(list, item).await?;
        Ok(())
    }

    async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        if timeout.is_zero() {
            // BRPOP with 0 would block forever.
            let item: Option<String> = redis::cmd("RPOP").arg(list).query_async(&mut conn).await?;
            return Ok(item);
        }
        // Block in short slices so a single call stays under the managed
        // connection's response timeout.
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let slice = remaining.min(BLOCKING_SLICE);
            let popped: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(list)
                .arg(slice.as_secs_f64())
                .query_async(&mut conn)
                .await?;
            if let Some((_, item)) = popped {
                return Ok(Some(item));
            }
        }
    }

    async fn peek_oldest(&self, list: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let item: Option<String> = conn.lindex(list, -1).await?;
        Ok(item)
    }

    async fn remove(&self, list: &str, item: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        // Negative count searches from the tail, where the oldest entries sit.
        let removed: usize = conn.lrem(list, -1, item).await?;
        Ok(removed)
    }

    async fn range(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut items: Vec<String> = conn.lrange(list, 0, -1).await?;
        items.reverse();
        Ok(items)
    }

    async fn len(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.conn.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(page_size.max(1))
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: usize = conn.del(keys).await?;
        Ok(())
    }
}
