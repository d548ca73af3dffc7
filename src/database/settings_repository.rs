use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};

/// One `app_settings` row
#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct SettingEntry {
    pub key: String,
    pub value: JsonValue,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<SettingEntry>, DatabaseError>;

    /// Create or replace a key
    async fn upsert(&self, key: &str, value: JsonValue) -> Result<SettingEntry, DatabaseError>;
}

pub struct SettingsRepository {
    pool: PgPool,
}

impl SettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for SettingsRepository {
    async fn load_all(&self) -> Result<Vec<SettingEntry>, DatabaseError> {
        sqlx::query_as::<_, SettingEntry>(
            "SELECT key, value, updated_at FROM app_settings ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn upsert(&self, key: &str, value: JsonValue) -> Result<SettingEntry, DatabaseError> {
        sqlx::query_as::<_, SettingEntry>(
            "INSERT INTO app_settings (key, value)
             VALUES ($1, $2)
             ON CONFLICT (key)
             DO UPDATE SET value = $2, updated_at = NOW()
             RETURNING key, value, updated_at",
        )
        .bind(key)
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
