//! Pass results and status views exposed to the UI

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::connectivity::Transport;
use super::record::EntityType;

/// Outcome of reconciling one entity type during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPassResult {
    /// Entity type that was reconciled
    pub entity_type: EntityType,

    /// Records accepted by the remote service
    pub succeeded: u32,

    /// Records rejected or not delivered
    pub failed: u32,

    /// Set when a store failure cut this entity type's pass short
    pub aborted: Option<String>,
}

impl EntityPassResult {
    /// Empty result for an entity type
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            succeeded: 0,
            failed: 0,
            aborted: None,
        }
    }

    /// Result of a pass that could not complete
    pub fn aborted(entity_type: EntityType, reason: impl Into<String>) -> Self {
        Self {
            aborted: Some(reason.into()),
            ..Self::new(entity_type)
        }
    }
}

/// Aggregate result of one sync pass over all entity types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPassResult {
    /// Sequence number assigned by the coordinator, starting at 1
    #[serde(default)]
    pub pass: u64,

    /// Per-entity-type results
    pub per_type: BTreeMap<EntityType, EntityPassResult>,

    /// When the pass started
    pub started_at: DateTime<Utc>,

    /// When the pass finished
    pub finished_at: DateTime<Utc>,
}

impl SyncPassResult {
    /// Build an aggregate from per-type results
    pub fn from_results(
        results: impl IntoIterator<Item = EntityPassResult>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            pass: 0,
            per_type: results.into_iter().map(|r| (r.entity_type, r)).collect(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Tag the result with its pass sequence number
    pub fn with_pass(mut self, pass: u64) -> Self {
        self.pass = pass;
        self
    }

    /// Records accepted across all entity types
    pub fn total_succeeded(&self) -> u32 {
        self.per_type.values().map(|r| r.succeeded).sum()
    }

    /// Records failed across all entity types
    pub fn total_failed(&self) -> u32 {
        self.per_type.values().map(|r| r.failed).sum()
    }

    /// Every submitted record was accepted and at least one was submitted
    pub fn all_synced(&self) -> bool {
        self.total_failed() == 0 && self.total_succeeded() > 0
    }

    /// Entity types whose pass was cut short by a store failure
    pub fn aborted_types(&self) -> Vec<EntityType> {
        self.per_type
            .values()
            .filter(|r| r.aborted.is_some())
            .map(|r| r.entity_type)
            .collect()
    }

    /// Whether the scheduler should treat this pass as failed
    pub fn has_failures(&self) -> bool {
        self.total_failed() > 0 || self.per_type.values().any(|r| r.aborted.is_some())
    }
}

/// Number of records not yet accepted by the remote service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsyncedCount {
    pub per_type: BTreeMap<EntityType, u64>,
    pub total: u64,
}

impl UnsyncedCount {
    /// Build from per-type counts
    pub fn from_counts(counts: impl IntoIterator<Item = (EntityType, u64)>) -> Self {
        let per_type: BTreeMap<_, _> = counts.into_iter().collect();
        let total = per_type.values().sum();
        Self { per_type, total }
    }
}

/// Data shown by the sync status indicator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusView {
    pub is_connected: bool,
    pub unsynced_count: u64,
    pub network_type: Transport,
}
