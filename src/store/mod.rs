//! Local record store for clinic-sync
//!
//! This module defines the per-entity-type record store trait and its
//! SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::{SqliteDatabase, SqliteRecordStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{EntityType, ServerRef, SyncableRecord};

/// Store of locally created records of one entity type
///
/// The sync executor is the only writer of sync metadata. The UI write path
/// only ever inserts new pending records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Entity type held by this store
    fn entity_type(&self) -> EntityType;

    // =========================================================================
    // Write path
    // =========================================================================

    /// Insert a new pending record
    async fn insert(&self, record: &SyncableRecord) -> Result<(), StoreError>;

    /// Look up a record by its local id
    async fn get(&self, local_id: &str) -> Result<Option<SyncableRecord>, StoreError>;

    // =========================================================================
    // Sync bookkeeping
    // =========================================================================

    /// Snapshot of all unsynced records (pending and failed), oldest first
    async fn list_pending(&self) -> Result<Vec<SyncableRecord>, StoreError>;

    /// Mark a record as accepted by the remote service
    ///
    /// Idempotent. A record that is already synced keeps its original
    /// server identifiers.
    async fn mark_synced(&self, local_id: &str, server_ref: &ServerRef) -> Result<(), StoreError>;

    /// Record a failed attempt; a no-op for records that are already synced
    async fn mark_failed(&self, local_id: &str, message: &str) -> Result<(), StoreError>;

    /// Number of unsynced records
    async fn count_pending(&self) -> Result<u64, StoreError>;

    // =========================================================================
    // Retention
    // =========================================================================

    /// Delete synced records accepted before `older_than`
    ///
    /// Returns the number of deleted records. Unsynced records are never
    /// deleted.
    async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}
