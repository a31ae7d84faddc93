//! Sync coordinator
//!
//! Runs every entity type's executor as one pass and guarantees that at
//! most one pass executes at any time. A request that arrives while a pass
//! is running is queued as a single follow-up pass; every request arriving
//! during the same in-flight pass shares that follow-up and its result.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::executor::SyncExecutor;
use crate::error::SyncError;
use crate::models::{EntityPassResult, EntityType, SyncPassResult};

type PassSender = watch::Sender<Option<SyncPassResult>>;
type PassReceiver = watch::Receiver<Option<SyncPassResult>>;

#[derive(Default)]
struct FlightState {
    running: bool,
    queued: Option<(PassSender, PassReceiver)>,
}

/// Composes the per-entity executors into single-flight passes
pub struct SyncCoordinator {
    executors: Vec<Arc<SyncExecutor>>,
    flight: Mutex<FlightState>,
    passes_started: AtomicU64,
    last_result: RwLock<Option<SyncPassResult>>,
}

impl SyncCoordinator {
    pub fn new(executors: Vec<SyncExecutor>) -> Arc<Self> {
        Arc::new(Self {
            executors: executors.into_iter().map(Arc::new).collect(),
            flight: Mutex::new(FlightState::default()),
            passes_started: AtomicU64::new(0),
            last_result: RwLock::new(None),
        })
    }

    /// Entity types covered by a pass
    pub fn entity_types(&self) -> Vec<EntityType> {
        self.executors.iter().map(|e| e.entity_type()).collect()
    }

    /// Run a pass, or wait for the follow-up pass if one is already running
    pub async fn run_pass(self: &Arc<Self>) -> Result<SyncPassResult, SyncError> {
        let mut rx = self.request_pass().await;
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SyncError::PassAborted)?;
        slot.clone().ok_or(SyncError::PassAborted)
    }

    /// Whether a pass is currently executing
    pub async fn is_running(&self) -> bool {
        self.flight.lock().await.running
    }

    /// Number of passes started since construction
    pub fn passes_started(&self) -> u64 {
        self.passes_started.load(Ordering::SeqCst)
    }

    /// Result of the most recent completed pass
    pub async fn last_result(&self) -> Option<SyncPassResult> {
        self.last_result.read().await.clone()
    }

    async fn request_pass(self: &Arc<Self>) -> PassReceiver {
        let mut flight = self.flight.lock().await;

        if flight.running {
            if let Some((_, rx)) = &flight.queued {
                debug!("Joining queued follow-up pass");
                return rx.clone();
            }
            let (tx, rx) = watch::channel(None);
            flight.queued = Some((tx, rx.clone()));
            info!("Sync pass in flight, follow-up pass queued");
            return rx;
        }

        flight.running = true;
        let (tx, rx) = watch::channel(None);
        let this = self.clone();
        tokio::spawn(async move { this.drive(tx).await });
        rx
    }

    /// Run passes until no follow-up is queued
    async fn drive(self: Arc<Self>, mut tx: PassSender) {
        loop {
            let result = self.execute_pass().await;
            *self.last_result.write().await = Some(result.clone());
            // No receivers left is fine; the result is kept in last_result
            let _ = tx.send(Some(result));

            let mut flight = self.flight.lock().await;
            match flight.queued.take() {
                Some((next, _)) => tx = next,
                None => {
                    flight.running = false;
                    break;
                }
            }
        }
    }

    async fn execute_pass(&self) -> SyncPassResult {
        let started_at = Utc::now();
        let pass = self.passes_started.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            pass = pass,
            entity_types = self.executors.len(),
            "Sync pass started"
        );

        let mut per_type: BTreeMap<EntityType, EntityPassResult> = self
            .executors
            .iter()
            .map(|e| {
                let entity = e.entity_type();
                (
                    entity,
                    EntityPassResult::aborted(entity, "entity pass did not complete"),
                )
            })
            .collect();

        let mut set = JoinSet::new();
        for executor in &self.executors {
            let executor = executor.clone();
            set.spawn(async move { executor.run().await });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    per_type.insert(result.entity_type, result);
                }
                Err(err) => error!(pass = pass, error = %err, "Entity pass task failed"),
            }
        }

        let result =
            SyncPassResult::from_results(per_type.into_values(), started_at).with_pass(pass);
        info!(
            pass = pass,
            succeeded = result.total_succeeded(),
            failed = result.total_failed(),
            all_synced = result.all_synced(),
            "Sync pass finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{ServerRef, SyncableRecord};
    use crate::store::{MockRecordStore, RecordStore};
    use crate::sync::remote::{MockRemoteSyncClient, RemoteSyncClient, SubmitOutcome};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Store with an empty queue whose listing takes `delay`
    struct SlowStore {
        entity: EntityType,
        delay: Duration,
        lists: Arc<AtomicU32>,
        active: Arc<AtomicU32>,
        max_active: Arc<AtomicU32>,
        panic_on_list: bool,
    }

    impl SlowStore {
        fn new(entity: EntityType, delay_ms: u64) -> Self {
            Self {
                entity,
                delay: Duration::from_millis(delay_ms),
                lists: Arc::new(AtomicU32::new(0)),
                active: Arc::new(AtomicU32::new(0)),
                max_active: Arc::new(AtomicU32::new(0)),
                panic_on_list: false,
            }
        }
    }

    #[async_trait]
    impl RecordStore for SlowStore {
        fn entity_type(&self) -> EntityType {
            self.entity
        }

        async fn insert(&self, _record: &SyncableRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get(&self, _local_id: &str) -> Result<Option<SyncableRecord>, StoreError> {
            Ok(None)
        }

        async fn list_pending(&self) -> Result<Vec<SyncableRecord>, StoreError> {
            if self.panic_on_list {
                panic!("store poisoned");
            }
            self.lists.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![])
        }

        async fn mark_synced(&self, _id: &str, _server_ref: &ServerRef) -> Result<(), StoreError> {
            Ok(())
        }

        async fn mark_failed(&self, _id: &str, _message: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn count_pending(&self) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn prune_synced(&self, _older_than: DateTime<Utc>) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn idle_client() -> Arc<dyn RemoteSyncClient> {
        let mut client = MockRemoteSyncClient::new();
        client.expect_submit().never();
        Arc::new(client)
    }

    // Test 1: A pass aggregates every entity type
    #[tokio::test]
    async fn test_pass_aggregates_results() {
        let mut patients = MockRecordStore::new();
        patients.expect_entity_type().return_const(EntityType::Patient);
        patients.expect_list_pending().returning(|| {
            Ok(vec![
                SyncableRecord::with_local_id(EntityType::Patient, "a", json!({})),
                SyncableRecord::with_local_id(EntityType::Patient, "b", json!({})),
            ])
        });
        patients.expect_mark_synced().returning(|_, _| Ok(()));
        patients.expect_mark_failed().returning(|_, _| Ok(()));

        let mut vitals = MockRecordStore::new();
        vitals.expect_entity_type().return_const(EntityType::Vitals);
        vitals.expect_list_pending().returning(|| Ok(vec![]));

        let mut client = MockRemoteSyncClient::new();
        client.expect_submit().returning(|_, record| {
            if record.local_id == "a" {
                SubmitOutcome::Accepted(ServerRef::new("1"))
            } else {
                SubmitOutcome::Rejected("invalid".to_string())
            }
        });
        let client: Arc<dyn RemoteSyncClient> = Arc::new(client);

        let coordinator = SyncCoordinator::new(vec![
            SyncExecutor::new(Arc::new(patients), client.clone()),
            SyncExecutor::new(Arc::new(vitals), client),
        ]);

        let result = coordinator.run_pass().await.unwrap();

        assert_eq!(result.per_type.len(), 2);
        assert_eq!(result.per_type[&EntityType::Patient].succeeded, 1);
        assert_eq!(result.per_type[&EntityType::Patient].failed, 1);
        assert_eq!(result.per_type[&EntityType::Vitals].succeeded, 0);
        assert_eq!(result.total_failed(), 1);
        assert!(!result.all_synced());
        assert_eq!(coordinator.last_result().await, Some(result));
    }

    // Test 2: Requests during a pass share exactly one follow-up pass
    #[tokio::test]
    async fn test_single_flight_queues_one_follow_up() {
        let store = SlowStore::new(EntityType::Patient, 150);
        let lists = store.lists.clone();
        let max_active = store.max_active.clone();

        let coordinator =
            SyncCoordinator::new(vec![SyncExecutor::new(Arc::new(store), idle_client())]);

        let first = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.run_pass().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(coordinator.is_running().await);

        // Manual and periodic trigger while the first pass is in flight
        let manual = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.run_pass().await })
        };
        let periodic = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.run_pass().await })
        };

        let first = first.await.unwrap().unwrap();
        let manual = manual.await.unwrap().unwrap();
        let periodic = periodic.await.unwrap().unwrap();

        assert_eq!(coordinator.passes_started(), 2);
        assert_eq!(lists.load(Ordering::SeqCst), 2);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(manual, periodic);
        assert_eq!((first.pass, manual.pass), (1, 2));
        assert!(manual.started_at >= first.finished_at);
        assert!(!coordinator.is_running().await);
    }

    // Test 3: Sequential requests each get their own pass
    #[tokio::test]
    async fn test_sequential_passes() {
        let store = SlowStore::new(EntityType::Vitals, 0);
        let coordinator =
            SyncCoordinator::new(vec![SyncExecutor::new(Arc::new(store), idle_client())]);

        coordinator.run_pass().await.unwrap();
        coordinator.run_pass().await.unwrap();
        coordinator.run_pass().await.unwrap();

        assert_eq!(coordinator.passes_started(), 3);
    }

    // Test 4: Entity types run concurrently within a pass
    #[tokio::test]
    async fn test_entity_types_run_concurrently() {
        let executors = EntityType::ALL
            .iter()
            .map(|e| SyncExecutor::new(Arc::new(SlowStore::new(*e, 200)), idle_client()))
            .collect();
        let coordinator = SyncCoordinator::new(executors);

        let start = std::time::Instant::now();
        let result = coordinator.run_pass().await.unwrap();

        assert!(start.elapsed() < Duration::from_millis(600));
        assert_eq!(result.per_type.len(), EntityType::ALL.len());
        assert_eq!(coordinator.entity_types(), EntityType::ALL.to_vec());
    }

    // Test 5: A crashing entity pass is reported without affecting others
    #[tokio::test]
    async fn test_crashing_entity_isolated() {
        let mut broken = SlowStore::new(EntityType::Vitals, 0);
        broken.panic_on_list = true;
        let healthy = SlowStore::new(EntityType::Patient, 0);
        let healthy_lists = healthy.lists.clone();

        let coordinator = SyncCoordinator::new(vec![
            SyncExecutor::new(Arc::new(healthy), idle_client()),
            SyncExecutor::new(Arc::new(broken), idle_client()),
        ]);

        let result = coordinator.run_pass().await.unwrap();

        assert_eq!(healthy_lists.load(Ordering::SeqCst), 1);
        assert_eq!(result.aborted_types(), vec![EntityType::Vitals]);
        assert!(result.has_failures());

        // The coordinator keeps working after the crash
        coordinator.run_pass().await.unwrap();
        assert_eq!(coordinator.passes_started(), 2);
    }

    // Test 6: Nothing is recorded before the first pass
    #[tokio::test]
    async fn test_initial_state() {
        let coordinator = SyncCoordinator::new(vec![]);
        assert!(!coordinator.is_running().await);
        assert_eq!(coordinator.passes_started(), 0);
        assert!(coordinator.last_result().await.is_none());

        let empty = coordinator.run_pass().await.unwrap();
        assert_eq!(empty.total_succeeded(), 0);
        assert!(!empty.all_synced());
    }
}
