//! UI-facing sync engine
//!
//! Wires stores, executors, coordinator, connectivity and scheduler together
//! and exposes the small surface the status indicator and write path need.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connectivity::ConnectivityMonitor;
use super::coordinator::SyncCoordinator;
use super::executor::{SyncExecutor, DEFAULT_SUBMIT_TIMEOUT};
use super::remote::{HttpRemoteClient, RemoteSyncClient};
use super::runtime::JobRuntime;
use super::scheduler::{SchedulerHandle, SchedulerState, SyncScheduler};
use crate::config::{
    Config, RemoteConfig, RetentionConfig, SchedulerSettings, SharedRemoteConfig,
};
use crate::error::{AppError, StoreError, SyncError};
use crate::models::{
    EntityPayload, EntityType, SyncPassResult, SyncStatusView, SyncableRecord, UnsyncedCount,
};
use crate::store::{RecordStore, SqliteDatabase};

/// Engine tuning that does not come from the remote section
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub retention: RetentionConfig,
    pub submit_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retention: RetentionConfig::default(),
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }
}

struct RunningScheduler {
    handle: SchedulerHandle,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<SchedulerState>,
}

/// Offline-first sync engine
pub struct SyncEngine {
    stores: BTreeMap<EntityType, Arc<dyn RecordStore>>,
    coordinator: Arc<SyncCoordinator>,
    monitor: Arc<ConnectivityMonitor>,
    remote: SharedRemoteConfig,
    retention: RetentionConfig,
    scheduler: Mutex<Option<RunningScheduler>>,
}

impl SyncEngine {
    /// Assemble an engine from its collaborators
    pub fn new(
        stores: Vec<Arc<dyn RecordStore>>,
        client: Arc<dyn RemoteSyncClient>,
        monitor: Arc<ConnectivityMonitor>,
        remote: SharedRemoteConfig,
        options: EngineOptions,
    ) -> Self {
        let executors = stores
            .iter()
            .map(|store| {
                SyncExecutor::new(store.clone(), client.clone())
                    .with_submit_timeout(options.submit_timeout)
            })
            .collect();

        Self {
            stores: stores.into_iter().map(|s| (s.entity_type(), s)).collect(),
            coordinator: SyncCoordinator::new(executors),
            monitor,
            remote,
            retention: options.retention,
            scheduler: Mutex::new(None),
        }
    }

    /// Open the SQLite store and HTTP client described by `config`
    pub async fn from_config(
        config: &Config,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Result<Self, AppError> {
        let database = SqliteDatabase::new(&config.database.path).await?;
        let stores: Vec<Arc<dyn RecordStore>> = database
            .stores()
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn RecordStore>)
            .collect();

        let remote = SharedRemoteConfig::new(config.remote.clone());
        let client = Arc::new(HttpRemoteClient::new(remote.clone()).await?);

        // Leave room for queueing behind the request limiter
        let submit_timeout = config
            .remote
            .request_timeout()
            .saturating_mul(2)
            .max(DEFAULT_SUBMIT_TIMEOUT);

        info!(
            database = %config.database.path,
            base_url = %config.remote.base_url,
            "Sync engine opened"
        );

        Ok(Self::new(
            stores,
            client,
            monitor,
            remote,
            EngineOptions {
                retention: config.retention.clone(),
                submit_timeout,
            },
        ))
    }

    pub fn monitor(&self) -> Arc<ConnectivityMonitor> {
        self.monitor.clone()
    }

    pub fn coordinator(&self) -> Arc<SyncCoordinator> {
        self.coordinator.clone()
    }

    fn store(&self, entity: EntityType) -> Result<&Arc<dyn RecordStore>, StoreError> {
        self.stores
            .get(&entity)
            .ok_or_else(|| StoreError::NotFound(format!("no store for {}", entity)))
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Store a new pending record with a fresh local id
    pub async fn enqueue(
        &self,
        entity: EntityType,
        payload: Value,
    ) -> Result<SyncableRecord, StoreError> {
        let record = SyncableRecord::new(entity, payload);
        self.store(entity)?.insert(&record).await?;
        debug!(entity = %entity, local_id = %record.local_id, "Record enqueued");
        Ok(record)
    }

    /// Store a typed payload as a new pending record
    pub async fn enqueue_payload<P: EntityPayload>(
        &self,
        payload: P,
    ) -> Result<SyncableRecord, StoreError> {
        let record = payload.into_record()?;
        self.store(P::ENTITY)?.insert(&record).await?;
        debug!(entity = %P::ENTITY, local_id = %record.local_id, "Record enqueued");
        Ok(record)
    }

    // =========================================================================
    // Status surface
    // =========================================================================

    /// Unsynced records per entity type and in total
    pub async fn get_unsynced_count(&self) -> Result<UnsyncedCount, StoreError> {
        let mut counts = Vec::with_capacity(self.stores.len());
        for (entity, store) in &self.stores {
            counts.push((*entity, store.count_pending().await?));
        }
        Ok(UnsyncedCount::from_counts(counts))
    }

    /// Data for the sync status indicator
    pub async fn get_sync_status(&self) -> Result<SyncStatusView, StoreError> {
        let connectivity = self.monitor.current();
        let unsynced = self.get_unsynced_count().await?;
        Ok(SyncStatusView {
            is_connected: connectivity.connected,
            unsynced_count: unsynced.total,
            network_type: connectivity.transport,
        })
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Ask for a sync as soon as possible
    ///
    /// Goes through the manual lane when the scheduler runs; otherwise a
    /// pass is started in the background. Either way it never overlaps a
    /// running pass.
    pub async fn trigger_manual_sync(&self) -> Result<(), SyncError> {
        if let Some(running) = self.scheduler.lock().await.as_ref() {
            return running.handle.trigger_manual_sync();
        }

        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            if let Err(err) = coordinator.run_pass().await {
                warn!(error = %err, "Manual sync pass failed");
            }
        });
        Ok(())
    }

    /// Run a pass now and wait for its result
    pub async fn sync_now(&self) -> Result<SyncPassResult, SyncError> {
        self.coordinator.run_pass().await
    }

    /// Start the scheduler; returns the existing handle if it already runs
    pub async fn start_scheduler(
        &self,
        runtime: Arc<dyn JobRuntime>,
        settings: SchedulerSettings,
        state: SchedulerState,
    ) -> SchedulerHandle {
        let mut slot = self.scheduler.lock().await;
        if let Some(running) = slot.as_ref() {
            return running.handle.clone();
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = SyncScheduler::new(
            self.coordinator.clone(),
            runtime,
            &self.monitor,
            settings,
            state,
            shutdown_rx,
        );
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        *slot = Some(RunningScheduler {
            handle: handle.clone(),
            shutdown_tx,
            task,
        });
        handle
    }

    /// Stop the scheduler and return its final state
    pub async fn stop_scheduler(&self) -> Option<SchedulerState> {
        let running = self.scheduler.lock().await.take()?;
        let _ = running.shutdown_tx.send(());
        match running.task.await {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(error = %err, "Scheduler task failed");
                None
            }
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete synced records older than the retention window
    pub async fn prune_synced(&self) -> Result<u64, StoreError> {
        let retention_days = i64::from(self.retention.synced_retention_days);
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let mut deleted = 0;
        for (entity, store) in &self.stores {
            let count = store.prune_synced(cutoff).await?;
            if count > 0 {
                debug!(entity = %entity, deleted = count, "Pruned synced records");
            }
            deleted += count;
        }
        info!(deleted = deleted, cutoff = %cutoff, "Retention prune finished");
        Ok(deleted)
    }

    /// Replace the remote configuration; the next submission uses it
    pub async fn update_remote_config(&self, config: RemoteConfig) {
        info!(base_url = %config.base_url, "Remote configuration updated");
        self.remote.replace(config).await;
    }

    /// Current remote configuration
    pub async fn remote_config(&self) -> RemoteConfig {
        self.remote.snapshot().await
    }

    /// Shared handle to the remote configuration, for the reachability probe
    pub fn remote_config_handle(&self) -> SharedRemoteConfig {
        self.remote.clone()
    }
}
