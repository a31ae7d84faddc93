//! clinic-sync - Offline-first record synchronization for clinic field devices
//!
//! Patients, vitals and assessments are captured into a local SQLite store
//! and reconciled with the remote clinic service whenever connectivity
//! allows, without ever losing or duplicating a record.

pub mod config;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;
pub mod telemetry;
