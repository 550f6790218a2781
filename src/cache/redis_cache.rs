//! Redis adapter for the key-value cache.

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;

use super::{CacheError, CacheStore};

const SCAN_BATCH: usize = 200;

#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
    timeout: Duration,
}

impl RedisCache {
    /// Builds the pool without touching the server; connections are made
    /// on first use so a cold Redis never blocks startup.
    pub fn new(url: &str, pool_size: usize, timeout: Duration) -> Result<Self, CacheError> {
        let pool = Config::from_url(url)
            .builder()
            .map_err(|e| CacheError::Connection(e.to_string()))?
            .max_size(pool_size)
            .wait_timeout(Some(timeout))
            .create_timeout(Some(timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self { pool, timeout })
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            redis::cmd("PING")
                .query_async::<String>(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn connection(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| CacheError::Timeout)?
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            conn.get::<_, Option<String>>(key)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))
        })
        .await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            let mut cursor: u64 = 0;
            let mut deleted = 0usize;
            loop {
                let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))?;

                if !keys.is_empty() {
                    let removed: usize = conn
                        .del(&keys)
                        .await
                        .map_err(|e| CacheError::Backend(e.to_string()))?;
                    deleted += removed;
                }

                if next_cursor == 0 {
                    break;
                }
                cursor = next_cursor;
            }
            Ok(deleted)
        })
        .await
    }
}
