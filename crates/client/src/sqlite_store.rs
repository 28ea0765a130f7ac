//! SQLite-backed [`LocalStore`].
//!
//! Two tables in one database file:
//! - `records`: keyed JSON documents (`store`, `key`) for the optimistic
//!   mirror and queue bookkeeping
//! - `mutation_queue`: one row per queued mutation

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use stowage_core::TenantId;

use crate::error::StoreError;
use crate::idempotency::IdempotencyKey;
use crate::payload::EntityPayload;
use crate::store::LocalStore;
use crate::types::{FailureKind, MutationEntry, MutationStatus, Operation};

/// SQLite store. Cheap to clone (the pool is reference counted).
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn storage(err: anyhow::Error) -> StoreError {
    StoreError::Storage(format!("{err:#}"))
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory at {parent:?}"))
                .map_err(storage)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite store at {path:?}"))
            .map_err(storage)?;

        Self::with_pool(pool).await
    }

    /// Open the store at the default location: `{data_dir}/stowage/offline.db`.
    pub async fn open_default() -> Result<Self, StoreError> {
        let path = default_db_path().map_err(storage)?;
        Self::open(path).await
    }

    /// Private in-memory database (single connection so every query sees it).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory SQLite store")
            .map_err(storage)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                store   TEXT NOT NULL,
                key     TEXT NOT NULL,
                record  TEXT NOT NULL,
                PRIMARY KEY (store, key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create records table")
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutation_queue (
                idempotency_key  TEXT PRIMARY KEY,
                tenant_id        TEXT NOT NULL,
                seq              INTEGER NOT NULL,
                operation        TEXT NOT NULL,
                entity_id        TEXT NULL,
                temp_id          TEXT NULL,
                payload          TEXT NOT NULL,
                depends_on       TEXT NOT NULL,
                timestamp        TEXT NOT NULL,
                retries          INTEGER NOT NULL,
                status           TEXT NOT NULL,
                next_attempt_at  TEXT NULL,
                last_error       TEXT NULL,
                failure          TEXT NULL,
                resolved_id      TEXT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create mutation_queue table")
        .map_err(storage)?;

        Ok(Self { pool })
    }

    async fn write_mutation(&self, entry: &MutationEntry, insert: bool) -> Result<u64, StoreError> {
        let payload = serde_json::to_string(&entry.payload)?;
        let depends_on = serde_json::to_string(&entry.depends_on)?;
        let sql = if insert {
            r#"
            INSERT INTO mutation_queue (
                idempotency_key, tenant_id, seq, operation, entity_id, temp_id,
                payload, depends_on, timestamp, retries, status,
                next_attempt_at, last_error, failure, resolved_id
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#
        } else {
            r#"
            UPDATE mutation_queue
            SET tenant_id = ?2, seq = ?3, operation = ?4, entity_id = ?5, temp_id = ?6,
                payload = ?7, depends_on = ?8, timestamp = ?9, retries = ?10, status = ?11,
                next_attempt_at = ?12, last_error = ?13, failure = ?14, resolved_id = ?15
            WHERE idempotency_key = ?1
            "#
        };

        let result = sqlx::query(sql)
            .bind(entry.idempotency_key.to_string())
            .bind(entry.tenant_id.to_string())
            .bind(entry.id as i64)
            .bind(entry.operation.as_str())
            .bind(entry.entity_id.as_deref())
            .bind(entry.temp_id.as_deref())
            .bind(payload)
            .bind(depends_on)
            .bind(entry.timestamp.to_rfc3339())
            .bind(entry.retries as i64)
            .bind(entry.status.as_str())
            .bind(entry.next_attempt_at.map(|t| t.to_rfc3339()))
            .bind(entry.last_error.as_deref())
            .bind(entry.failure.map(|f| f.as_str()))
            .bind(entry.resolved_id.as_deref())
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(entry.idempotency_key.to_string()))
            }
            Err(err) => Err(storage(
                anyhow::Error::new(err).context("failed to write queued mutation"),
            )),
        }
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn put(&self, store: &str, key: &str, record: &Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO records (store, key, record)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (store, key) DO UPDATE SET record = excluded.record
            "#,
        )
        .bind(store)
        .bind(key)
        .bind(record.to_string())
        .execute(&self.pool)
        .await
        .context("failed to put record")
        .map_err(storage)?;
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT record FROM records WHERE store = ?1 AND key = ?2")
            .bind(store)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get record")
            .map_err(storage)?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("record").map_err(|e| storage(e.into()))?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, store: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM records WHERE store = ?1 AND key = ?2")
            .bind(store)
            .bind(key)
            .execute(&self.pool)
            .await
            .context("failed to delete record")
            .map_err(storage)?;
        Ok(())
    }

    async fn scan(&self, store: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let rows = sqlx::query("SELECT key, record FROM records WHERE store = ?1 ORDER BY key ASC")
            .bind(store)
            .fetch_all(&self.pool)
            .await
            .context("failed to scan records")
            .map_err(storage)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key").map_err(|e| storage(e.into()))?;
            let raw: String = row.try_get("record").map_err(|e| storage(e.into()))?;
            out.push((key, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    async fn insert_mutation(&self, entry: &MutationEntry) -> Result<(), StoreError> {
        self.write_mutation(entry, true).await.map(|_| ())
    }

    async fn update_mutation(&self, entry: &MutationEntry) -> Result<(), StoreError> {
        match self.write_mutation(entry, false).await? {
            0 => Err(StoreError::NotFound(entry.idempotency_key.to_string())),
            _ => Ok(()),
        }
    }

    async fn delete_mutation(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM mutation_queue WHERE tenant_id = ?1 AND idempotency_key = ?2")
            .bind(tenant_id.to_string())
            .bind(key.to_string())
            .execute(&self.pool)
            .await
            .context("failed to delete queued mutation")
            .map_err(storage)?;
        Ok(())
    }

    async fn load_mutations(&self, tenant_id: TenantId) -> Result<Vec<MutationEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                idempotency_key, tenant_id, seq, operation, entity_id, temp_id,
                payload, depends_on, timestamp, retries, status,
                next_attempt_at, last_error, failure, resolved_id
            FROM mutation_queue
            WHERE tenant_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to load queued mutations")
        .map_err(storage)?;

        rows.into_iter()
            .map(|row| row_to_entry(row).map_err(storage))
            .collect()
    }
}

/// Map a database row into a `MutationEntry`.
fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<MutationEntry> {
    let key_str: String = row.try_get("idempotency_key")?;
    let idempotency_key = IdempotencyKey::from_str(&key_str)
        .context("invalid idempotency_key in mutation_queue")?;

    let tenant_str: String = row.try_get("tenant_id")?;
    let tenant_id = TenantId::from_str(&tenant_str).context("invalid tenant_id in mutation_queue")?;

    let seq: i64 = row.try_get("seq")?;
    let operation_str: String = row.try_get("operation")?;
    let operation = Operation::from_str(&operation_str)?;

    let payload_str: String = row.try_get("payload")?;
    let payload: EntityPayload =
        serde_json::from_str(&payload_str).context("invalid payload in mutation_queue")?;

    let depends_str: String = row.try_get("depends_on")?;
    let depends_on: Vec<IdempotencyKey> =
        serde_json::from_str(&depends_str).context("invalid depends_on in mutation_queue")?;

    let timestamp_str: String = row.try_get("timestamp")?;
    let retries: i64 = row.try_get("retries")?;
    let status_str: String = row.try_get("status")?;

    let next_attempt_str: Option<String> = row.try_get("next_attempt_at")?;
    let failure_str: Option<String> = row.try_get("failure")?;

    Ok(MutationEntry {
        id: u64::try_from(seq).context("negative seq in mutation_queue")?,
        idempotency_key,
        tenant_id,
        operation,
        entity: payload.kind(),
        entity_id: row.try_get("entity_id")?,
        temp_id: row.try_get("temp_id")?,
        payload,
        depends_on,
        timestamp: parse_time(&timestamp_str).context("invalid timestamp in mutation_queue")?,
        retries: u32::try_from(retries).unwrap_or(u32::MAX),
        status: MutationStatus::from_str(&status_str)?,
        next_attempt_at: next_attempt_str
            .as_deref()
            .map(parse_time)
            .transpose()
            .context("invalid next_attempt_at in mutation_queue")?,
        last_error: row.try_get("last_error")?,
        failure: failure_str.as_deref().map(FailureKind::from_str).transpose()?,
        resolved_id: row.try_get("resolved_id")?,
    })
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// `{data_dir}/stowage/offline.db`, falling back to `~/.local/share`.
fn default_db_path() -> anyhow::Result<PathBuf> {
    let mut dir = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory")?;

    dir.push("stowage");
    dir.push("offline.db");
    Ok(dir)
}
