//! Offline-first synchronization
//!
//! Records captured without connectivity wait in the local store until a
//! sync pass submits them to the remote service.
//!
//! # Components
//!
//! - [`remote`]: HTTP client submitting single records
//! - [`executor`]: one pass over the pending queue of one entity type
//! - [`coordinator`]: single-flight pass over every entity type
//! - [`connectivity`]: connectivity state and transitions
//! - [`runtime`]: timers that fire scheduled jobs
//! - [`backoff`]: interval growth after failed passes
//! - [`scheduler`]: reactive, periodic and manual triggers
//! - [`engine`]: the surface used by the UI and the write path
//!
//! # Example
//!
//! ```ignore
//! use clinic_sync::config::Config;
//! use clinic_sync::sync::{ConnectivityMonitor, SyncEngine};
//!
//! let config = Config::from_file("clinic-sync.yaml")?;
//! let monitor = Arc::new(ConnectivityMonitor::default());
//! let engine = SyncEngine::from_config(&config, monitor).await?;
//!
//! let result = engine.sync_now().await?;
//! println!("{} records synced", result.total_succeeded());
//! ```

pub mod backoff;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod executor;
pub mod remote;
pub mod runtime;
pub mod scheduler;

pub use backoff::BackoffPolicy;
pub use connectivity::{
    probe_once, spawn_reachability_probe, ConnectivityMonitor, ConnectivitySubscription,
};
pub use coordinator::SyncCoordinator;
pub use engine::{EngineOptions, SyncEngine};
pub use executor::{SyncExecutor, DEFAULT_SUBMIT_TIMEOUT};
pub use remote::{HttpRemoteClient, RemoteSyncClient, SubmitOutcome, IDEMPOTENCY_HEADER};
pub use runtime::{FiredJob, JobRuntime, JobSink, OneTimeJob, PeriodicJob, TokioJobRuntime};
pub use scheduler::{
    Lane, LaneState, SchedulerHandle, SchedulerState, SyncScheduler, MANUAL_JOB_KEY,
    MANUAL_JOB_TAG, PERIODIC_JOB_KEY, PERIODIC_JOB_TAG,
};
