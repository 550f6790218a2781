use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::settings::default_settings;

pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| "Failed to create lazy database pool".to_string())
}

/// Creates the directory and settings tables if absent and seeds missing
/// default settings. Safe to run on every start.
pub async fn ensure_schema(db: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS machine_metadata (
            id UUID PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            location VARCHAR(500) NOT NULL,
            sensor_type VARCHAR(100) NOT NULL,
            status VARCHAR(50) NOT NULL DEFAULT 'active',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT chk_status CHECK (status IN ('active', 'inactive', 'maintenance', 'error'))
        )
        "#,
    )
    .execute(db)
    .await
    .context("failed to create machine_metadata")?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_machine_metadata_name ON machine_metadata (name)",
        "CREATE INDEX IF NOT EXISTS idx_machine_metadata_location ON machine_metadata (location)",
        "CREATE INDEX IF NOT EXISTS idx_machine_metadata_status ON machine_metadata (status)",
    ] {
        sqlx::query(statement)
            .execute(db)
            .await
            .with_context(|| format!("failed to run {statement}"))?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_config (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            setting_name VARCHAR(255) NOT NULL UNIQUE,
            setting_value TEXT NOT NULL,
            description TEXT,
            updated_by VARCHAR(255),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(db)
    .await
    .context("failed to create system_config")?;

    for (name, value) in default_settings() {
        sqlx::query(
            r#"
            INSERT INTO system_config (setting_name, setting_value, updated_by)
            VALUES ($1, $2, 'system')
            ON CONFLICT (setting_name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(db)
        .await
        .with_context(|| format!("failed to seed setting {name}"))?;
    }

    Ok(())
}
