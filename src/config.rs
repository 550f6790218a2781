use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Redis,
    Memory,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsdbBackend {
    Influx,
    Memory,
}

#[derive(Debug, Clone)]
pub struct InfluxSettings {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub qos: u8,
    pub client_id: String,
    pub keepalive: Duration,
    pub status_topic: String,
    pub max_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub tsdb_backend: TsdbBackend,
    pub influx: InfluxSettings,
    pub cache_backend: CacheBackend,
    pub redis_url: Option<String>,
    pub cache_pool_size: usize,
    pub machine_cache_ttl: Duration,
    pub enable_mqtt: bool,
    pub mqtt: MqttSettings,
    pub dependency_timeout: Duration,
    pub broadcast_queue: usize,
    pub subscriber_buffer: usize,
    pub batch_concurrency: usize,
    pub api_tokens: String,
    pub otel_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = env_optional_string("DATABASE_URL")
            .context("DATABASE_URL must be set for the ingest service")?;
        let database_url = normalize_database_url(database_url);

        let redis_url = env_optional_string("REDIS_URL");
        let cache_backend = match env_optional_string("CACHE_BACKEND")
            .map(|value| value.to_lowercase())
            .as_deref()
        {
            Some("memory") => CacheBackend::Memory,
            Some("none") | Some("disabled") => CacheBackend::Disabled,
            Some("redis") => {
                if redis_url.is_none() {
                    anyhow::bail!("CACHE_BACKEND=redis requires REDIS_URL");
                }
                CacheBackend::Redis
            }
            Some(other) => anyhow::bail!("unknown CACHE_BACKEND {other:?}"),
            None if redis_url.is_some() => CacheBackend::Redis,
            None => CacheBackend::Disabled,
        };

        let tsdb_backend = match env_optional_string("TSDB_BACKEND")
            .map(|value| value.to_lowercase())
            .as_deref()
        {
            None | Some("influx") | Some("influxdb") => TsdbBackend::Influx,
            Some("memory") => TsdbBackend::Memory,
            Some(other) => anyhow::bail!("unknown TSDB_BACKEND {other:?}"),
        };

        let qos = env_u8("MQTT_QOS", 1);
        if qos > 2 {
            anyhow::bail!("MQTT_QOS must be 0, 1 or 2 (got {qos})");
        }

        Ok(Self {
            database_url,
            db_pool_size: env_u32("DB_POOL_SIZE", 10),
            tsdb_backend,
            influx: InfluxSettings {
                url: env_string("INFLUXDB_URL", "http://localhost:8086"),
                token: env_string("INFLUXDB_TOKEN", ""),
                org: env_string("INFLUXDB_ORG", ""),
                bucket: env_string("INFLUXDB_BUCKET", "sensor_data"),
                measurement: env_string("INFLUXDB_MEASUREMENT", "sensor_readings"),
            },
            cache_backend,
            redis_url,
            cache_pool_size: env_usize("CACHE_POOL_SIZE", 8),
            machine_cache_ttl: Duration::from_secs(env_u64("MACHINE_CACHE_TTL_SECONDS", 3600)),
            enable_mqtt: env_bool("ENABLE_MQTT", true),
            mqtt: MqttSettings {
                broker: env_string("MQTT_BROKER", "localhost"),
                port: env_u16("MQTT_PORT", 1883),
                username: env_optional_string("MQTT_USERNAME"),
                password: env_optional_string("MQTT_PASSWORD"),
                topic: env_string("MQTT_TOPIC", "realm/+/device/+/telemetry"),
                qos,
                client_id: env_optional_string("MQTT_CLIENT_ID")
                    .unwrap_or_else(|| format!("sensor-ingest-{}", std::process::id())),
                keepalive: Duration::from_secs(env_u64("MQTT_KEEPALIVE_SECS", 60)),
                status_topic: env_string("MQTT_STATUS_TOPIC", "realm/backend/status"),
                max_in_flight: env_usize("MQTT_MAX_IN_FLIGHT", 64),
            },
            dependency_timeout: Duration::from_millis(env_u64("DEPENDENCY_TIMEOUT_MS", 5000)),
            broadcast_queue: env_usize("BROADCAST_QUEUE", 1024),
            subscriber_buffer: env_usize("SUBSCRIBER_BUFFER", 64),
            batch_concurrency: env_usize("BATCH_CONCURRENCY", 8),
            api_tokens: env_string("API_TOKENS", ""),
            otel_endpoint: env_optional_string("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|value| value.trim().to_lowercase())
    {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u8(key: &str, default: u8) -> u8 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u8>().ok())
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn normalize_database_url(url: String) -> String {
    for driver in ["postgresql+psycopg2://", "postgresql+psycopg://", "postgresql+asyncpg://"] {
        if let Some(stripped) = url.strip_prefix(driver) {
            return format!("postgresql://{stripped}");
        }
    }
    url
}
