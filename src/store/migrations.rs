//! Database migrations for clinic-sync
//!
//! This module contains SQL migrations for the SQLite database schema.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- Locally captured records awaiting or past synchronization
CREATE TABLE IF NOT EXISTS sync_records (
    entity_type TEXT NOT NULL,
    local_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    sync_state TEXT NOT NULL DEFAULT 'pending'
        CHECK (sync_state IN ('pending', 'failed', 'synced')),
    sync_error TEXT,
    server_id TEXT,
    server_ref TEXT,
    created_at_ms INTEGER NOT NULL,
    synced_at_ms INTEGER,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at_ms INTEGER,
    PRIMARY KEY (entity_type, local_id),
    CHECK ((sync_state = 'synced') = (server_id IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_sync_records_pending
    ON sync_records(entity_type, sync_state, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_sync_records_synced_at
    ON sync_records(entity_type, synced_at_ms);
"#;

/// Get the migration version
pub fn migration_version() -> i32 {
    1
}
