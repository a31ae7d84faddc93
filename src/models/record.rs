//! Locally captured records and their sync metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Kinds of records the client captures offline
///
/// Each entity type has its own pending queue and is reconciled by its own
/// executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Patient,
    Vitals,
    GeneralAssessment,
    OverweightAssessment,
}

impl EntityType {
    /// Every entity type, in display order
    pub const ALL: [EntityType; 4] = [
        EntityType::Patient,
        EntityType::Vitals,
        EntityType::GeneralAssessment,
        EntityType::OverweightAssessment,
    ];

    /// Stable name used in storage, config keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Patient => "patient",
            EntityType::Vitals => "vitals",
            EntityType::GeneralAssessment => "general_assessment",
            EntityType::OverweightAssessment => "overweight_assessment",
        }
    }

    /// Default path of the remote endpoint, relative to the base URL
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            EntityType::Patient => "/patients",
            EntityType::Vitals => "/vitals",
            EntityType::GeneralAssessment => "/assessments/general",
            EntityType::OverweightAssessment => "/assessments/overweight",
        }
    }

    /// Field of the response `data` object holding the server identifier
    pub fn server_id_field(&self) -> &'static str {
        match self {
            EntityType::Patient => "patient_id",
            EntityType::Vitals => "vitals_id",
            EntityType::GeneralAssessment | EntityType::OverweightAssessment => "assessment_id",
        }
    }

    /// Field of the response `data` object holding a secondary reference, if any
    pub fn server_ref_field(&self) -> Option<&'static str> {
        match self {
            EntityType::Patient => Some("unique_id"),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EntityType::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| AppError::UnknownEntity(s.to_string()))
    }
}

/// Sync state of a record
///
/// `Failed` is still "not yet synced": it stays eligible for retry and only
/// differs from `Pending` by carrying the last diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Synced,
    Failed(String),
}

impl SyncState {
    /// Storage name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Failed(_) => "failed",
        }
    }

    /// Whether the record still awaits acceptance by the remote service
    pub fn is_unsynced(&self) -> bool {
        !matches!(self, SyncState::Synced)
    }

    /// Diagnostic message of the last failed attempt
    pub fn error_message(&self) -> Option<&str> {
        match self {
            SyncState::Failed(message) => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Failed(message) => write!(f, "failed: {}", message),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Identifiers assigned by the remote service on acceptance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRef {
    /// Primary server identifier
    pub server_id: String,

    /// Secondary reference (e.g. a patient's unique registration number)
    pub server_ref: Option<String>,
}

impl ServerRef {
    /// Create a reference holding only a server id
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            server_ref: None,
        }
    }

    /// Attach a secondary reference
    pub fn with_ref(mut self, server_ref: impl Into<String>) -> Self {
        self.server_ref = Some(server_ref.into());
        self
    }
}

/// A locally created record together with its sync metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    /// Entity type the record belongs to
    pub entity_type: EntityType,

    /// Locally assigned identifier, unique within the entity type
    pub local_id: String,

    /// Entity-specific business fields; opaque to the sync engine
    pub payload: serde_json::Value,

    /// Current sync state
    pub sync_state: SyncState,

    /// Server identifiers; present iff `sync_state` is `Synced`
    pub server_ref: Option<ServerRef>,

    /// Logical creation time; defines submission order
    pub created_at: DateTime<Utc>,

    /// When the remote service accepted the record
    pub synced_at: Option<DateTime<Utc>>,

    /// Number of failed submission attempts
    pub attempt_count: u32,

    /// When the last failed attempt happened
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl SyncableRecord {
    /// Create a new pending record with a fresh local id
    pub fn new(entity_type: EntityType, payload: serde_json::Value) -> Self {
        Self::with_local_id(entity_type, uuid::Uuid::new_v4().to_string(), payload)
    }

    /// Create a new pending record with the given local id
    pub fn with_local_id(
        entity_type: EntityType,
        local_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            local_id: local_id.into(),
            payload,
            sync_state: SyncState::Pending,
            server_ref: None,
            created_at: Utc::now(),
            synced_at: None,
            attempt_count: 0,
            last_attempt_at: None,
        }
    }

    /// Override the creation time
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether the remote service has accepted this record
    pub fn is_synced(&self) -> bool {
        matches!(self.sync_state, SyncState::Synced)
    }

    /// Last sync error, if the previous attempt failed
    pub fn sync_error(&self) -> Option<&str> {
        self.sync_state.error_message()
    }

    /// Key used for logs and idempotency headers
    pub fn key(&self) -> String {
        format!("{}:{}", self.entity_type, self.local_id)
    }
}
