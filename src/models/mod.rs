//! Domain models for clinic-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod connectivity;
pub mod entities;
pub mod record;
pub mod status;

// Re-export commonly used types
pub use connectivity::{ConnectivityState, ConnectivityTransition, Transport};
pub use entities::{EntityPayload, GeneralAssessment, OverweightAssessment, Patient, Vitals};
pub use record::{EntityType, ServerRef, SyncState, SyncableRecord};
pub use status::{EntityPassResult, SyncPassResult, SyncStatusView, UnsyncedCount};
