//! Machine metadata: the authoritative directory of known machines.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::ErrorDetail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    #[default]
    Active,
    Inactive,
    Maintenance,
    Error,
}

impl MachineStatus {
    pub const ALLOWED: [&'static str; 4] = ["active", "inactive", "maintenance", "error"];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(MachineStatus::Active),
            "inactive" => Some(MachineStatus::Inactive),
            "maintenance" => Some(MachineStatus::Maintenance),
            "error" => Some(MachineStatus::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MachineStatus::Active => "active",
            MachineStatus::Inactive => "inactive",
            MachineStatus::Maintenance => "maintenance",
            MachineStatus::Error => "error",
        }
    }
}

/// One machine as recorded in the directory. Also the cached representation
/// used by the resolver, so it round-trips through JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDirectoryEntry {
    pub id: Uuid,
    pub name: String,
    pub location: String,
    pub sensor_type: String,
    pub status: MachineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMachine {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub sensor_type: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl NewMachine {
    /// Checks lengths and the status value; returns every problem found.
    pub fn validate(&self) -> Result<MachineStatus, Vec<ErrorDetail>> {
        let mut errors = Vec::new();
        for (field, value, max) in [
            ("name", &self.name, 255),
            ("location", &self.location, 500),
            ("sensor_type", &self.sensor_type, 100),
        ] {
            let len = value.trim().chars().count();
            if len == 0 || len > max {
                errors.push(ErrorDetail::new(
                    field,
                    format!("must be between 1 and {max} characters"),
                    Some(value.clone()),
                ));
            }
        }

        let status = match self.status.as_deref() {
            None => Some(MachineStatus::Active),
            Some(raw) => MachineStatus::parse(raw),
        };
        if status.is_none() {
            errors.push(ErrorDetail::new(
                "status",
                format!("must be one of: {}", MachineStatus::ALLOWED.join(", ")),
                self.status.clone(),
            ));
        }

        match status {
            Some(status) if errors.is_empty() => Ok(status),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineFilter {
    pub location: Option<String>,
    pub status: Option<String>,
    pub sensor_type: Option<String>,
}

impl MachineFilter {
    fn matches(&self, entry: &MachineDirectoryEntry) -> bool {
        self.location.as_deref().map_or(true, |l| l == entry.location)
            && self.status.as_deref().map_or(true, |s| s == entry.status.as_str())
            && self
                .sensor_type
                .as_deref()
                .map_or(true, |t| t == entry.sensor_type)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("machine with name {0} already exists")]
    Duplicate(String),

    #[error("stored machine record is invalid: {0}")]
    Decode(String),

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MachineDirectory: Send + Sync {
    async fn find(&self, id: Uuid) -> Result<Option<MachineDirectoryEntry>, DirectoryError>;

    async fn list(&self, filter: &MachineFilter) -> Result<Vec<MachineDirectoryEntry>, DirectoryError>;

    async fn create(
        &self,
        machine: &NewMachine,
        status: MachineStatus,
    ) -> Result<MachineDirectoryEntry, DirectoryError>;
}

#[derive(sqlx::FromRow)]
struct MachineRow {
    id: Uuid,
    name: String,
    location: String,
    sensor_type: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MachineRow> for MachineDirectoryEntry {
    type Error = DirectoryError;

    fn try_from(row: MachineRow) -> Result<Self, Self::Error> {
        let status = MachineStatus::parse(&row.status)
            .ok_or_else(|| DirectoryError::Decode(format!("unknown status {:?}", row.status)))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            location: row.location,
            sensor_type: row.sensor_type,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgMachineDirectory {
    db: PgPool,
}

impl PgMachineDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MachineDirectory for PgMachineDirectory {
    async fn find(&self, id: Uuid) -> Result<Option<MachineDirectoryEntry>, DirectoryError> {
        let row: Option<MachineRow> = sqlx::query_as(
            r#"
            SELECT id, name, location, sensor_type, status, created_at, updated_at
            FROM machine_metadata
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(MachineDirectoryEntry::try_from).transpose()
    }

    async fn list(&self, filter: &MachineFilter) -> Result<Vec<MachineDirectoryEntry>, DirectoryError> {
        let rows: Vec<MachineRow> = sqlx::query_as(
            r#"
            SELECT id, name, location, sensor_type, status, created_at, updated_at
            FROM machine_metadata
            WHERE ($1::text IS NULL OR location = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR sensor_type = $3)
            ORDER BY created_at, name
            "#,
        )
        .bind(filter.location.as_deref())
        .bind(filter.status.as_deref())
        .bind(filter.sensor_type.as_deref())
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(MachineDirectoryEntry::try_from).collect()
    }

    async fn create(
        &self,
        machine: &NewMachine,
        status: MachineStatus,
    ) -> Result<MachineDirectoryEntry, DirectoryError> {
        let name = machine.name.trim();
        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM machine_metadata WHERE name = $1 LIMIT 1")
                .bind(name)
                .fetch_optional(&self.db)
                .await?;
        if existing.is_some() {
            return Err(DirectoryError::Duplicate(name.to_string()));
        }

        let row: MachineRow = sqlx::query_as(
            r#"
            INSERT INTO machine_metadata (id, name, location, sensor_type, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, location, sensor_type, status, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(machine.location.trim())
        .bind(machine.sensor_type.trim())
        .bind(status.as_str())
        .fetch_one(&self.db)
        .await?;
        MachineDirectoryEntry::try_from(row)
    }
}

/// Directory held in process memory, for local runs without Postgres.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    machines: Arc<RwLock<HashMap<Uuid, MachineDirectoryEntry>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: MachineDirectoryEntry) {
        if let Ok(mut machines) = self.machines.write() {
            machines.insert(entry.id, entry);
        }
    }

    fn poisoned() -> DirectoryError {
        DirectoryError::Unavailable("memory directory poisoned".to_string())
    }
}

#[async_trait]
impl MachineDirectory for MemoryDirectory {
    async fn find(&self, id: Uuid) -> Result<Option<MachineDirectoryEntry>, DirectoryError> {
        let machines = self.machines.read().map_err(|_| Self::poisoned())?;
        Ok(machines.get(&id).cloned())
    }

    async fn list(&self, filter: &MachineFilter) -> Result<Vec<MachineDirectoryEntry>, DirectoryError> {
        let machines = self.machines.read().map_err(|_| Self::poisoned())?;
        let mut entries: Vec<_> = machines
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(entries)
    }

    async fn create(
        &self,
        machine: &NewMachine,
        status: MachineStatus,
    ) -> Result<MachineDirectoryEntry, DirectoryError> {
        let mut machines = self.machines.write().map_err(|_| Self::poisoned())?;
        let name = machine.name.trim();
        if machines.values().any(|entry| entry.name == name) {
            return Err(DirectoryError::Duplicate(name.to_string()));
        }
        let now = Utc::now();
        let entry = MachineDirectoryEntry {
            id: Uuid::new_v4(),
            name: name.to_string(),
            location: machine.location.trim().to_string(),
            sensor_type: machine.sensor_type.trim().to_string(),
            status,
            created_at: now,
            updated_at: now,
        };
        machines.insert(entry.id, entry.clone());
        Ok(entry)
    }
}
