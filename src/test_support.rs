use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::auth::StaticTokenProvider;
use crate::cache::{CacheError, CacheStore, MemoryCache};
use crate::config::{CacheBackend, Config, InfluxSettings, MqttSettings, TsdbBackend};
use crate::directory::{
    DirectoryError, MachineDirectory, MachineDirectoryEntry, MachineFilter, MachineStatus,
    MemoryDirectory, NewMachine,
};
use crate::settings::MemorySettingsStore;
use crate::state::AppState;
use crate::tsdb::{FieldRecord, MemoryStore, RangeQuery, StoreError, TimeSeriesPoint, TimeSeriesStore};
use tower::ServiceExt;

pub const ADMIN_TOKEN: &str = "admin-token";
pub const VIEWER_TOKEN: &str = "viewer-token";

const TEST_TOKENS: &str = "admin:admin-token=write:sensor_data|read:sensor_data|write:machines|read:machines|read:config|write:config;\
viewer:viewer-token=read:sensor_data|read:machines|read:config";

pub fn machine_entry(name: &str, location: &str) -> MachineDirectoryEntry {
    let now = Utc::now();
    MachineDirectoryEntry {
        id: Uuid::new_v4(),
        name: name.to_string(),
        location: location.to_string(),
        sensor_type: "Temperature".to_string(),
        status: MachineStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

/// Fixed directory that counts `find` calls and can be switched into an
/// outage.
#[derive(Default)]
pub struct CountingDirectory {
    entries: Mutex<Vec<MachineDirectoryEntry>>,
    lookups: AtomicUsize,
    unavailable: AtomicBool,
}

impl CountingDirectory {
    pub fn with(entries: Vec<MachineDirectoryEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Self::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MachineDirectory for CountingDirectory {
    async fn find(&self, id: Uuid) -> Result<Option<MachineDirectoryEntry>, DirectoryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let entries = self.entries.lock().expect("directory lock");
        Ok(entries.iter().find(|entry| entry.id == id).cloned())
    }

    async fn list(&self, _filter: &MachineFilter) -> Result<Vec<MachineDirectoryEntry>, DirectoryError> {
        self.check()?;
        Ok(self.entries.lock().expect("directory lock").clone())
    }

    async fn create(
        &self,
        machine: &NewMachine,
        status: MachineStatus,
    ) -> Result<MachineDirectoryEntry, DirectoryError> {
        self.check()?;
        let mut entry = machine_entry(&machine.name, &machine.location);
        entry.sensor_type = machine.sensor_type.clone();
        entry.status = status;
        self.entries.lock().expect("directory lock").push(entry.clone());
        Ok(entry)
    }
}

/// Cache whose every operation fails.
pub struct FlakyCache;

impl FlakyCache {
    pub fn failing() -> Self {
        FlakyCache
    }
}

#[async_trait]
impl CacheStore for FlakyCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Connection("connection refused".to_string()))
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Connection("connection refused".to_string()))
    }

    async fn delete_pattern(&self, _pattern: &str) -> Result<usize, CacheError> {
        Err(CacheError::Timeout)
    }
}

/// Time-series store that rejects every `every`-th write (every write when
/// `every == 1`).
pub struct FlakyStore {
    every: usize,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn failing() -> Self {
        Self::failing_every(1)
    }

    pub fn failing_every(every: usize) -> Self {
        Self {
            every: every.max(1),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TimeSeriesStore for FlakyStore {
    async fn write_point(&self, _point: &TimeSeriesPoint) -> Result<(), StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % self.every == 0 {
            return Err(StoreError::Unavailable("write refused".to_string()));
        }
        Ok(())
    }

    async fn query_range(&self, _query: &RangeQuery) -> Result<Vec<FieldRecord>, StoreError> {
        Err(StoreError::Timeout)
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        db_pool_size: 1,
        tsdb_backend: TsdbBackend::Memory,
        influx: InfluxSettings {
            url: "http://127.0.0.1:8086".to_string(),
            token: String::new(),
            org: "factory".to_string(),
            bucket: "sensor_data".to_string(),
            measurement: "sensor_readings".to_string(),
        },
        cache_backend: CacheBackend::Memory,
        redis_url: None,
        cache_pool_size: 1,
        machine_cache_ttl: Duration::from_secs(3600),
        enable_mqtt: false,
        mqtt: MqttSettings {
            broker: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            topic: "realm/+/device/+/telemetry".to_string(),
            qos: 1,
            client_id: "sensor-ingest-tests".to_string(),
            keepalive: Duration::from_secs(60),
            status_topic: "realm/backend/status".to_string(),
            max_in_flight: 4,
        },
        dependency_timeout: Duration::from_secs(1),
        broadcast_queue: 64,
        subscriber_buffer: 16,
        batch_concurrency: 4,
        api_tokens: TEST_TOKENS.to_string(),
        otel_endpoint: None,
    }
}

/// In-memory application plus handles on its backends for seeding and
/// inspection.
pub struct TestApp {
    pub state: AppState,
    pub directory: MemoryDirectory,
    pub store: MemoryStore,
    pub cache: MemoryCache,
}

pub fn test_app() -> TestApp {
    let config = test_config();
    let identity = Arc::new(StaticTokenProvider::parse(&config.api_tokens));
    let directory = MemoryDirectory::new();
    let store = MemoryStore::new();
    let cache = MemoryCache::new();
    let state = AppState::new(
        config,
        identity,
        Arc::new(directory.clone()),
        Arc::new(MemorySettingsStore::new()),
        Some(Arc::new(cache.clone())),
        Arc::new(store.clone()),
    );
    TestApp {
        state,
        directory,
        store,
        cache,
    }
}

/// Application state over caller-supplied directory and store, for
/// exercising outage paths.
pub fn test_app_with(
    directory: Arc<dyn MachineDirectory>,
    store: Arc<dyn TimeSeriesStore>,
) -> AppState {
    let config = test_config();
    let identity = Arc::new(StaticTokenProvider::parse(&config.api_tokens));
    AppState::new(
        config,
        identity,
        directory,
        Arc::new(MemorySettingsStore::new()),
        Some(Arc::new(MemoryCache::new())),
        store,
    )
}

/// Sends one request through `router` and returns status, headers and the
/// JSON body (`Null` when the body is empty, a JSON string holding the raw
/// text when the body is not JSON).
pub async fn call(
    router: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<JsonValue>,
) -> (StatusCode, HeaderMap, JsonValue) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, headers, json)
}
