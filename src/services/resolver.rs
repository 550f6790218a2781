use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::directory::{DirectoryError, MachineDirectory, MachineDirectoryEntry};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("machine {0} not found")]
    NotFound(Uuid),

    #[error("machine directory unavailable: {0}")]
    Unavailable(#[from] DirectoryError),
}

pub fn cache_key(machine_id: Uuid) -> String {
    format!("machine_metadata:{machine_id}")
}

/// Cache-aside lookup of machine metadata. A cache hit never touches the
/// directory; every cache failure degrades to a directory read. Misses are
/// not cached.
#[derive(Clone)]
pub struct MachineResolver {
    directory: Arc<dyn MachineDirectory>,
    cache: Option<Arc<dyn CacheStore>>,
    ttl: Duration,
}

impl MachineResolver {
    pub fn new(
        directory: Arc<dyn MachineDirectory>,
        cache: Option<Arc<dyn CacheStore>>,
        ttl: Duration,
    ) -> Self {
        Self {
            directory,
            cache,
            ttl,
        }
    }

    pub async fn resolve(&self, machine_id: Uuid) -> Result<MachineDirectoryEntry, ResolveError> {
        let key = cache_key(machine_id);

        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<MachineDirectoryEntry>(&raw) {
                    Ok(entry) => {
                        tracing::debug!(%machine_id, "machine metadata cache hit");
                        return Ok(entry);
                    }
                    Err(err) => {
                        tracing::warn!(%machine_id, error = %err, "discarding undecodable cache entry");
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%machine_id, error = %err, "machine cache read failed; using directory");
                }
            }
        }

        let entry = self
            .directory
            .find(machine_id)
            .await?
            .ok_or(ResolveError::NotFound(machine_id))?;

        if let Some(cache) = &self.cache {
            match serde_json::to_string(&entry) {
                Ok(raw) => {
                    if let Err(err) = cache.set_ex(&key, &raw, self.ttl).await {
                        tracing::warn!(%machine_id, error = %err, "machine cache write failed");
                    }
                }
                Err(err) => tracing::warn!(%machine_id, error = %err, "failed to encode cache entry"),
            }
        }

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::test_support::{machine_entry, CountingDirectory, FlakyCache};

    #[tokio::test]
    async fn second_resolve_is_served_from_cache() {
        let entry = machine_entry("Press 7", "Plant A");
        let directory = Arc::new(CountingDirectory::with(vec![entry.clone()]));
        let cache = Arc::new(MemoryCache::default());
        let resolver = MachineResolver::new(
            directory.clone(),
            Some(cache.clone()),
            Duration::from_secs(3600),
        );

        assert_eq!(resolver.resolve(entry.id).await.unwrap(), entry);
        assert_eq!(resolver.resolve(entry.id).await.unwrap(), entry);
        assert_eq!(directory.lookups(), 1);
        assert!(cache.get(&cache_key(entry.id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failing_cache_falls_through_to_directory() {
        let entry = machine_entry("Lathe 2", "Plant B");
        let directory = Arc::new(CountingDirectory::with(vec![entry.clone()]));
        let resolver = MachineResolver::new(
            directory.clone(),
            Some(Arc::new(FlakyCache::failing())),
            Duration::from_secs(3600),
        );

        assert_eq!(resolver.resolve(entry.id).await.unwrap(), entry);
        assert_eq!(resolver.resolve(entry.id).await.unwrap(), entry);
        assert_eq!(directory.lookups(), 2);
    }

    #[tokio::test]
    async fn unknown_machine_is_not_cached() {
        let directory = Arc::new(CountingDirectory::with(vec![]));
        let cache = Arc::new(MemoryCache::default());
        let resolver = MachineResolver::new(
            directory.clone(),
            Some(cache.clone()),
            Duration::from_secs(3600),
        );
        let id = Uuid::new_v4();

        assert!(matches!(resolver.resolve(id).await, Err(ResolveError::NotFound(_))));
        assert!(matches!(resolver.resolve(id).await, Err(ResolveError::NotFound(_))));
        assert_eq!(directory.lookups(), 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn directory_outage_is_distinct_from_not_found() {
        let directory = Arc::new(CountingDirectory::with(vec![]));
        directory.set_unavailable(true);
        let resolver = MachineResolver::new(directory, None, Duration::from_secs(60));
        assert!(matches!(
            resolver.resolve(Uuid::new_v4()).await,
            Err(ResolveError::Unavailable(_))
        ));
    }
}
