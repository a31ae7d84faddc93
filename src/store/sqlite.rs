//! SQLite implementation of the RecordStore trait
//!
//! This module provides a SQLite-based implementation of the RecordStore trait
//! using rusqlite and tokio-rusqlite for async operations. All entity types
//! share one database; each `SqliteRecordStore` is scoped to one of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::migrations::{migration_version, CREATE_SCHEMA};
use super::RecordStore;
use crate::error::StoreError;
use crate::models::{EntityType, ServerRef, SyncState, SyncableRecord};

const SELECT_COLUMNS: &str = r#"
    SELECT local_id, payload, sync_state, sync_error, server_id, server_ref,
           created_at_ms, synced_at_ms, attempt_count, last_attempt_at_ms
    FROM sync_records
"#;

/// SQLite database holding the records of every entity type
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Open (or create) a database and run migrations
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;

        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            conn.pragma_update(None, "user_version", migration_version())?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:").await
    }

    /// Store scoped to one entity type
    pub fn store(&self, entity_type: EntityType) -> SqliteRecordStore {
        SqliteRecordStore {
            conn: self.conn.clone(),
            entity_type,
        }
    }

    /// One store per entity type
    pub fn stores(&self) -> Vec<SqliteRecordStore> {
        EntityType::ALL.iter().map(|e| self.store(*e)).collect()
    }
}

/// Record store for a single entity type backed by SQLite
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Connection,
    entity_type: EntityType,
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    // =========================================================================
    // Write path
    // =========================================================================

    async fn insert(&self, record: &SyncableRecord) -> Result<(), StoreError> {
        if record.entity_type != self.entity_type {
            return Err(StoreError::Corrupt {
                local_id: record.local_id.clone(),
                reason: format!(
                    "{} record inserted into {} store",
                    record.entity_type, self.entity_type
                ),
            });
        }
        if record.sync_state != SyncState::Pending {
            return Err(StoreError::Corrupt {
                local_id: record.local_id.clone(),
                reason: "only pending records can be inserted".to_string(),
            });
        }

        let entity = self.entity_type.as_str();
        let local_id = record.local_id.clone();
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let created_at_ms = record.created_at.timestamp_millis();

        let inserted = {
            let local_id = local_id.clone();
            self.conn
                .call(move |conn| {
                    let count = conn.execute(
                        r#"
                        INSERT OR IGNORE INTO sync_records
                        (entity_type, local_id, payload, sync_state, created_at_ms)
                        VALUES (?1, ?2, ?3, 'pending', ?4)
                        "#,
                        rusqlite::params![entity, local_id, payload, created_at_ms],
                    )?;
                    Ok(count)
                })
                .await?
        };

        if inserted == 0 {
            return Err(StoreError::Duplicate(format!("{}:{}", entity, local_id)));
        }

        Ok(())
    }

    async fn get(&self, local_id: &str) -> Result<Option<SyncableRecord>, StoreError> {
        let entity = self.entity_type.as_str();
        let local_id = local_id.to_string();

        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE entity_type = ?1 AND local_id = ?2",
                    SELECT_COLUMNS
                ))?;
                let row = stmt
                    .query_row(rusqlite::params![entity, local_id], RecordRow::from_row)
                    .optional()?;
                Ok(row)
            })
            .await?;

        row.map(|r| r.into_record(self.entity_type)).transpose()
    }

    // =========================================================================
    // Sync bookkeeping
    // =========================================================================

    async fn list_pending(&self) -> Result<Vec<SyncableRecord>, StoreError> {
        let entity = self.entity_type.as_str();

        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"{}
                    WHERE entity_type = ?1 AND sync_state IN ('pending', 'failed')
                    ORDER BY created_at_ms ASC, rowid ASC
                    "#,
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([entity], RecordRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|r| r.into_record(self.entity_type))
            .collect()
    }

    async fn mark_synced(&self, local_id: &str, server_ref: &ServerRef) -> Result<(), StoreError> {
        let entity = self.entity_type.as_str();
        let id = local_id.to_string();
        let server_id = server_ref.server_id.clone();
        let secondary = server_ref.server_ref.clone();
        let now_ms = Utc::now().timestamp_millis();

        let exists = self
            .conn
            .call(move |conn| {
                let updated = conn.execute(
                    r#"
                    UPDATE sync_records
                    SET sync_state = 'synced', sync_error = NULL,
                        server_id = ?3, server_ref = ?4, synced_at_ms = ?5
                    WHERE entity_type = ?1 AND local_id = ?2 AND sync_state != 'synced'
                    "#,
                    rusqlite::params![entity, id, server_id, secondary, now_ms],
                )?;
                if updated > 0 {
                    return Ok(true);
                }
                record_exists(conn, entity, &id)
            })
            .await?;

        if !exists {
            return Err(StoreError::NotFound(format!("{}:{}", entity, local_id)));
        }

        Ok(())
    }

    async fn mark_failed(&self, local_id: &str, message: &str) -> Result<(), StoreError> {
        let entity = self.entity_type.as_str();
        let id = local_id.to_string();
        let message = message.to_string();
        let now_ms = Utc::now().timestamp_millis();

        let exists = self
            .conn
            .call(move |conn| {
                let updated = conn.execute(
                    r#"
                    UPDATE sync_records
                    SET sync_state = 'failed', sync_error = ?3,
                        attempt_count = attempt_count + 1, last_attempt_at_ms = ?4
                    WHERE entity_type = ?1 AND local_id = ?2 AND sync_state != 'synced'
                    "#,
                    rusqlite::params![entity, id, message, now_ms],
                )?;
                if updated > 0 {
                    return Ok(true);
                }
                record_exists(conn, entity, &id)
            })
            .await?;

        if !exists {
            return Err(StoreError::NotFound(format!("{}:{}", entity, local_id)));
        }

        Ok(())
    }

    async fn count_pending(&self) -> Result<u64, StoreError> {
        let entity = self.entity_type.as_str();

        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    r#"
                    SELECT COUNT(*) FROM sync_records
                    WHERE entity_type = ?1 AND sync_state IN ('pending', 'failed')
                    "#,
                    [entity],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Retention
    // =========================================================================

    async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let entity = self.entity_type.as_str();
        let cutoff_ms = older_than.timestamp_millis();

        self.conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    DELETE FROM sync_records
                    WHERE entity_type = ?1 AND sync_state = 'synced' AND synced_at_ms < ?2
                    "#,
                    rusqlite::params![entity, cutoff_ms],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }
}

fn record_exists(
    conn: &rusqlite::Connection,
    entity: &str,
    local_id: &str,
) -> Result<bool, tokio_rusqlite::Error> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sync_records WHERE entity_type = ?1 AND local_id = ?2)",
        rusqlite::params![entity, local_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Raw row as stored; decoded outside the connection thread
struct RecordRow {
    local_id: String,
    payload: String,
    sync_state: String,
    sync_error: Option<String>,
    server_id: Option<String>,
    server_ref: Option<String>,
    created_at_ms: i64,
    synced_at_ms: Option<i64>,
    attempt_count: i64,
    last_attempt_at_ms: Option<i64>,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            payload: row.get(1)?,
            sync_state: row.get(2)?,
            sync_error: row.get(3)?,
            server_id: row.get(4)?,
            server_ref: row.get(5)?,
            created_at_ms: row.get(6)?,
            synced_at_ms: row.get(7)?,
            attempt_count: row.get(8)?,
            last_attempt_at_ms: row.get(9)?,
        })
    }

    fn into_record(self, entity_type: EntityType) -> Result<SyncableRecord, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            local_id: self.local_id.clone(),
            reason,
        };

        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("invalid payload: {}", e)))?;

        let sync_state = match self.sync_state.as_str() {
            "pending" => SyncState::Pending,
            "failed" => SyncState::Failed(self.sync_error.clone().unwrap_or_default()),
            "synced" => SyncState::Synced,
            other => return Err(corrupt(format!("unknown sync state '{}'", other))),
        };

        let server_ref = match (&sync_state, self.server_id.clone()) {
            (SyncState::Synced, Some(server_id)) => Some(ServerRef {
                server_id,
                server_ref: self.server_ref.clone(),
            }),
            (SyncState::Synced, None) => {
                return Err(corrupt("synced record without server id".to_string()))
            }
            _ => None,
        };

        let created_at = from_millis(self.created_at_ms)
            .ok_or_else(|| corrupt(format!("invalid created_at {}", self.created_at_ms)))?;

        Ok(SyncableRecord {
            entity_type,
            local_id: self.local_id.clone(),
            payload,
            sync_state,
            server_ref,
            created_at,
            synced_at: self.synced_at_ms.and_then(from_millis),
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(u32::MAX),
            last_attempt_at: self.last_attempt_at_ms.and_then(from_millis),
        })
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}
