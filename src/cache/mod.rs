//! Key-value cache seam shared by the machine resolver and the response
//! cache. Every caller treats errors from here as a cache miss.

mod memory;
mod redis_cache;

pub use self::memory::MemoryCache;
pub use self::redis_cache::RedisCache;

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid key pattern: {0}")]
    Pattern(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Deletes every key matching a glob pattern such as `cache:config:*`.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError>;
}
