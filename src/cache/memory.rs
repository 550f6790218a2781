use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{CacheError, CacheStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local cache, used when no Redis is configured with
/// `CACHE_BACKEND=memory` and throughout the tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    data: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let data = self.data.read().await;
        data.values().filter(|entry| entry.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => Ok(Some(entry.value.clone())),
            Some(_) => {
                drop(data);
                self.data.write().await.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Writes also sweep out every expired entry, so keys that are never
    /// read again do not accumulate.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut data = self.data.write().await;
        data.retain(|_, entry| entry.expires_at > now);
        data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let matcher =
            glob::Pattern::new(pattern).map_err(|err| CacheError::Pattern(err.to_string()))?;
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|key, _| !matcher.matches(key));
        Ok(before - data.len())
    }
}
