use std::sync::Arc;

use crate::auth::IdentityProvider;
use crate::cache::CacheStore;
use crate::config::Config;
use crate::directory::MachineDirectory;
use crate::services::batch_ingest::BatchProcessor;
use crate::services::broadcaster::Broadcaster;
use crate::services::mqtt_ingest::IngestMonitor;
use crate::services::query::QueryEngine;
use crate::services::resolver::MachineResolver;
use crate::services::response_cache::ResponseCache;
use crate::settings::SettingsStore;
use crate::tsdb::TimeSeriesStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub identity: Arc<dyn IdentityProvider>,
    pub directory: Arc<dyn MachineDirectory>,
    pub settings: Arc<dyn SettingsStore>,
    pub resolver: MachineResolver,
    pub response_cache: ResponseCache,
    pub store: Arc<dyn TimeSeriesStore>,
    pub broadcaster: Broadcaster,
    pub batch: BatchProcessor,
    pub query: QueryEngine,
    pub monitor: Arc<IngestMonitor>,
}

impl AppState {
    /// Wires the services on top of the chosen backends. The resolver and
    /// the response cache share one cache store.
    pub fn new(
        config: Config,
        identity: Arc<dyn IdentityProvider>,
        directory: Arc<dyn MachineDirectory>,
        settings: Arc<dyn SettingsStore>,
        cache: Option<Arc<dyn CacheStore>>,
        store: Arc<dyn TimeSeriesStore>,
    ) -> Self {
        let resolver = MachineResolver::new(
            directory.clone(),
            cache.clone(),
            config.machine_cache_ttl,
        );
        let broadcaster = Broadcaster::new(config.broadcast_queue, config.subscriber_buffer);
        let batch = BatchProcessor::new(
            resolver.clone(),
            store.clone(),
            broadcaster.clone(),
            config.batch_concurrency,
        );
        let query = QueryEngine::new(resolver.clone(), store.clone());

        Self {
            config,
            identity,
            directory,
            settings,
            resolver,
            response_cache: ResponseCache::new(cache),
            store,
            broadcaster,
            batch,
            query,
            monitor: Arc::new(IngestMonitor::new()),
        }
    }
}
