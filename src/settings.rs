//! System-wide key/value settings (alert thresholds, retention, contacts).

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub type SettingsMap = BTreeMap<String, String>;

pub fn default_settings() -> [(&'static str, &'static str); 4] {
    [
        ("max_temperature_threshold", "80.0"),
        ("max_pressure_threshold", "150.0"),
        ("alert_email", "alerts@factory.com"),
        ("data_retention_days", "365"),
    ]
}

fn defaults_map() -> SettingsMap {
    default_settings()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("settings store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn all(&self) -> Result<SettingsMap, SettingsError>;

    /// Stores `value` and returns the previous value, if any.
    async fn set(
        &self,
        name: &str,
        value: &str,
        updated_by: &str,
    ) -> Result<Option<String>, SettingsError>;

    /// Replaces every setting with the defaults and returns them.
    async fn reset(&self, updated_by: &str) -> Result<SettingsMap, SettingsError>;
}

#[derive(Clone)]
pub struct PgSettingsStore {
    db: PgPool,
}

impl PgSettingsStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn all(&self) -> Result<SettingsMap, SettingsError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT setting_name, setting_value FROM system_config ORDER BY setting_name",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn set(
        &self,
        name: &str,
        value: &str,
        updated_by: &str,
    ) -> Result<Option<String>, SettingsError> {
        let mut tx = self.db.begin().await?;
        let old: Option<String> = sqlx::query_scalar(
            "SELECT setting_value FROM system_config WHERE setting_name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO system_config (setting_name, setting_value, updated_by)
            VALUES ($1, $2, $3)
            ON CONFLICT (setting_name) DO UPDATE
            SET setting_value = EXCLUDED.setting_value,
                updated_by = EXCLUDED.updated_by,
                updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(updated_by)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(old)
    }

    async fn reset(&self, updated_by: &str) -> Result<SettingsMap, SettingsError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM system_config")
            .execute(&mut *tx)
            .await?;
        for (name, value) in default_settings() {
            sqlx::query(
                "INSERT INTO system_config (setting_name, setting_value, updated_by) VALUES ($1, $2, $3)",
            )
            .bind(name)
            .bind(value)
            .bind(updated_by)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(defaults_map())
    }
}

#[derive(Clone)]
pub struct MemorySettingsStore {
    values: Arc<RwLock<SettingsMap>>,
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self {
            values: Arc::new(RwLock::new(defaults_map())),
        }
    }
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> SettingsError {
        SettingsError::Unavailable("memory settings poisoned".to_string())
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn all(&self) -> Result<SettingsMap, SettingsError> {
        Ok(self.values.read().map_err(|_| Self::poisoned())?.clone())
    }

    async fn set(
        &self,
        name: &str,
        value: &str,
        _updated_by: &str,
    ) -> Result<Option<String>, SettingsError> {
        let mut values = self.values.write().map_err(|_| Self::poisoned())?;
        Ok(values.insert(name.to_string(), value.to_string()))
    }

    async fn reset(&self, _updated_by: &str) -> Result<SettingsMap, SettingsError> {
        let mut values = self.values.write().map_err(|_| Self::poisoned())?;
        *values = defaults_map();
        Ok(values.clone())
    }
}
