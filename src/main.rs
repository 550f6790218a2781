use anyhow::{Context, Result};
use clap::Parser;
use sensor_ingest::auth::StaticTokenProvider;
use sensor_ingest::cache::{CacheStore, MemoryCache, RedisCache};
use sensor_ingest::config::{CacheBackend, Config, TsdbBackend};
use sensor_ingest::directory::PgMachineDirectory;
use sensor_ingest::services::mqtt_ingest::{MqttIngestService, TelemetryHandler};
use sensor_ingest::settings::PgSettingsStore;
use sensor_ingest::state::AppState;
use sensor_ingest::tsdb::{InfluxStore, MemoryStore, TimeSeriesStore};
use sensor_ingest::{cli, db, routes};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    if let Some(endpoint) = &config.otel_endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-ingest"),
            ])))
            .install_batch(Tokio)?;

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }
    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn build_cache(config: &Config) -> Result<Option<Arc<dyn CacheStore>>> {
    match config.cache_backend {
        CacheBackend::Disabled => {
            tracing::info!("response and metadata caching disabled");
            Ok(None)
        }
        CacheBackend::Memory => Ok(Some(Arc::new(MemoryCache::new()))),
        CacheBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("REDIS_URL must be set for the redis cache backend")?;
            let redis = RedisCache::new(url, config.cache_pool_size, config.dependency_timeout)?;
            if let Err(err) = redis.ping().await {
                tracing::warn!(error = %err, "redis not reachable yet; cache reads will fall through");
            }
            Ok(Some(Arc::new(redis)))
        }
    }
}

fn build_store(config: &Config) -> Result<Arc<dyn TimeSeriesStore>> {
    Ok(match config.tsdb_backend {
        TsdbBackend::Influx => {
            let influx = &config.influx;
            Arc::new(InfluxStore::new(
                &influx.url,
                &influx.token,
                &influx.org,
                &influx.bucket,
                &influx.measurement,
                config.dependency_timeout,
            )?)
        }
        TsdbBackend::Memory => {
            tracing::warn!("using in-memory time-series store; readings are not persisted");
            Arc::new(MemoryStore::new())
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = db::connect_lazy(&config.database_url, config.db_pool_size)?;
    if let Err(err) = db::ensure_schema(&pool).await {
        tracing::warn!("failed to ensure database schema: {err:#}");
    }

    let identity = StaticTokenProvider::parse(&config.api_tokens);
    if identity.is_empty() {
        tracing::warn!("API_TOKENS is empty; every protected endpoint will answer 401");
    }
    let cache = build_cache(&config).await?;
    let store = build_store(&config)?;

    let state = AppState::new(
        config.clone(),
        Arc::new(identity),
        Arc::new(PgMachineDirectory::new(pool.clone())),
        Arc::new(PgSettingsStore::new(pool)),
        cache,
        store,
    );

    let cancel = CancellationToken::new();
    let broadcaster_task = state.broadcaster.start(cancel.clone());
    let mqtt_task = if config.enable_mqtt && !args.no_mqtt {
        let handler = TelemetryHandler::new(
            state.resolver.clone(),
            state.store.clone(),
            state.broadcaster.clone(),
            state.monitor.clone(),
        );
        Some(
            MqttIngestService::new(config.mqtt.clone(), Arc::new(handler), state.monitor.clone())
                .start(cancel.clone()),
        )
    } else {
        tracing::info!("mqtt ingest disabled");
        None
    };

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind sensor-ingest listener on {addr}"))?;
    tracing::info!(%addr, "sensor-ingest listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    for task in [broadcaster_task, mqtt_task].into_iter().flatten() {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "background task ended abnormally");
        }
    }
    Ok(())
}
