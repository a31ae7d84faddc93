//! Per-entity-type sync executor
//!
//! Drains one entity type's pending queue through the remote client,
//! strictly in creation order and one record at a time.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::remote::{RemoteSyncClient, SubmitOutcome};
use crate::models::{EntityPassResult, EntityType, SyncableRecord};
use crate::store::RecordStore;

/// Upper bound on one submission, including time spent waiting for a slot
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Reconciles the records of one entity type
pub struct SyncExecutor {
    store: Arc<dyn RecordStore>,
    client: Arc<dyn RemoteSyncClient>,
    submit_timeout: Duration,
}

impl SyncExecutor {
    /// Create an executor for the store's entity type
    pub fn new(store: Arc<dyn RecordStore>, client: Arc<dyn RemoteSyncClient>) -> Self {
        Self {
            store,
            client,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }

    /// Override the per-submission timeout
    pub fn with_submit_timeout(mut self, submit_timeout: Duration) -> Self {
        self.submit_timeout = submit_timeout;
        self
    }

    /// Entity type this executor reconciles
    pub fn entity_type(&self) -> EntityType {
        self.store.entity_type()
    }

    /// Run one pass over the pending snapshot
    ///
    /// Store failures end this entity type's pass early and are reported in
    /// the result; they are never returned as errors.
    pub async fn run(&self) -> EntityPassResult {
        let entity = self.entity_type();
        let mut result = EntityPassResult::new(entity);

        let records = match self.store.list_pending().await {
            Ok(records) => records,
            Err(err) => {
                error!(entity = %entity, error = %err, "Failed to list pending records");
                return EntityPassResult::aborted(entity, err.to_string());
            }
        };

        if records.is_empty() {
            debug!(entity = %entity, "No pending records");
            return result;
        }

        for record in records {
            let outcome = self.submit_isolated(entity, &record).await;

            let marked = match &outcome {
                SubmitOutcome::Accepted(server_ref) => {
                    debug!(
                        entity = %entity,
                        local_id = %record.local_id,
                        server_id = %server_ref.server_id,
                        "Record accepted"
                    );
                    self.store
                        .mark_synced(&record.local_id, server_ref)
                        .await
                        .map(|()| result.succeeded += 1)
                }
                SubmitOutcome::Rejected(message) | SubmitOutcome::TransportFailure(message) => {
                    debug!(
                        entity = %entity,
                        local_id = %record.local_id,
                        error = %message,
                        "Record not synced"
                    );
                    self.store
                        .mark_failed(&record.local_id, message)
                        .await
                        .map(|()| result.failed += 1)
                }
            };

            if let Err(err) = marked {
                error!(
                    entity = %entity,
                    local_id = %record.local_id,
                    error = %err,
                    "Failed to record sync outcome"
                );
                result.aborted = Some(err.to_string());
                break;
            }
        }

        info!(
            entity = %entity,
            succeeded = result.succeeded,
            failed = result.failed,
            "Entity pass finished"
        );

        result
    }

    /// Submit in a separate task so a timeout or panic becomes a transport failure
    async fn submit_isolated(&self, entity: EntityType, record: &SyncableRecord) -> SubmitOutcome {
        let client = self.client.clone();
        let owned = record.clone();
        let mut handle = tokio::spawn(async move { client.submit(entity, &owned).await });

        match tokio::time::timeout(self.submit_timeout, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                warn!(
                    entity = %entity,
                    local_id = %record.local_id,
                    error = %join_err,
                    "Submission task failed"
                );
                SubmitOutcome::TransportFailure(format!("submission aborted: {}", join_err))
            }
            Err(_) => {
                handle.abort();
                warn!(
                    entity = %entity,
                    local_id = %record.local_id,
                    timeout_ms = self.submit_timeout.as_millis() as u64,
                    "Submission timed out"
                );
                SubmitOutcome::TransportFailure("Network timeout".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::ServerRef;
    use crate::store::MockRecordStore;
    use crate::sync::remote::MockRemoteSyncClient;
    use mockall::Sequence;
    use serde_json::json;

    fn pending(ids: &[&str]) -> Vec<SyncableRecord> {
        ids.iter()
            .map(|id| SyncableRecord::with_local_id(EntityType::Patient, *id, json!({})))
            .collect()
    }

    fn patient_store() -> MockRecordStore {
        let mut store = MockRecordStore::new();
        store.expect_entity_type().return_const(EntityType::Patient);
        store
    }

    // Test 1: Empty queue issues no remote calls
    #[tokio::test]
    async fn test_empty_queue() {
        let mut store = patient_store();
        store.expect_list_pending().returning(|| Ok(vec![]));

        let mut client = MockRemoteSyncClient::new();
        client.expect_submit().never();

        let executor = SyncExecutor::new(Arc::new(store), Arc::new(client));
        let result = executor.run().await;

        assert_eq!(result, EntityPassResult::new(EntityType::Patient));
    }

    // Test 2: Records are submitted in order and each outcome is recorded
    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let mut store = patient_store();
        store
            .expect_list_pending()
            .returning(|| Ok(pending(&["a", "b", "c"])));
        store
            .expect_mark_synced()
            .withf(|id, _| id == "a" || id == "c")
            .times(2)
            .returning(|_, _| Ok(()));
        store
            .expect_mark_failed()
            .withf(|id, message| id == "b" && message == "Network timeout")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut seq = Sequence::new();
        let mut client = MockRemoteSyncClient::new();
        for id in ["a", "b", "c"] {
            client
                .expect_submit()
                .withf(move |entity, record| {
                    *entity == EntityType::Patient && record.local_id == id
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, record| {
                    if record.local_id == "b" {
                        SubmitOutcome::TransportFailure("Network timeout".to_string())
                    } else {
                        SubmitOutcome::Accepted(ServerRef::new(format!("srv-{}", record.local_id)))
                    }
                });
        }

        let executor = SyncExecutor::new(Arc::new(store), Arc::new(client));
        let result = executor.run().await;

        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        assert!(result.aborted.is_none());
    }

    // Test 3: Rejections are recorded with the server message
    #[tokio::test]
    async fn test_rejection_recorded() {
        let mut store = patient_store();
        store.expect_list_pending().returning(|| Ok(pending(&["dup"])));
        store
            .expect_mark_failed()
            .withf(|id, message| id == "dup" && message == "duplicate unique id")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut client = MockRemoteSyncClient::new();
        client
            .expect_submit()
            .returning(|_, _| SubmitOutcome::Rejected("duplicate unique id".to_string()));

        let executor = SyncExecutor::new(Arc::new(store), Arc::new(client));
        let result = executor.run().await;

        assert_eq!((result.succeeded, result.failed), (0, 1));
    }

    // Test 4: Listing failure aborts only this pass
    #[tokio::test]
    async fn test_list_failure_aborts() {
        let mut store = patient_store();
        store
            .expect_list_pending()
            .returning(|| Err(StoreError::NotFound("sync_records".to_string())));

        let mut client = MockRemoteSyncClient::new();
        client.expect_submit().never();

        let executor = SyncExecutor::new(Arc::new(store), Arc::new(client));
        let result = executor.run().await;

        assert_eq!(result.succeeded, 0);
        assert!(result.aborted.unwrap().contains("sync_records"));
    }

    // Test 5: A failed write stops the pass for this entity type
    #[tokio::test]
    async fn test_mark_failure_stops_pass() {
        let mut store = patient_store();
        store
            .expect_list_pending()
            .returning(|| Ok(pending(&["a", "b"])));
        store
            .expect_mark_synced()
            .times(1)
            .returning(|_, _| Err(StoreError::Serialization("disk full".to_string())));

        let mut client = MockRemoteSyncClient::new();
        client
            .expect_submit()
            .times(1)
            .returning(|_, _| SubmitOutcome::Accepted(ServerRef::new("1")));

        let executor = SyncExecutor::new(Arc::new(store), Arc::new(client));
        let result = executor.run().await;

        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failed, 0);
        assert!(result.aborted.is_some());
    }

    /// Client that panics on the record with local id "boom"
    struct PanickingClient;

    #[async_trait::async_trait]
    impl RemoteSyncClient for PanickingClient {
        async fn submit(&self, _entity: EntityType, record: &SyncableRecord) -> SubmitOutcome {
            if record.local_id == "boom" {
                panic!("unexpected payload");
            }
            SubmitOutcome::Accepted(ServerRef::new("1"))
        }
    }

    // Test 6: A panicking submission is recorded as a transport failure
    #[tokio::test]
    async fn test_panic_isolated() {
        let mut store = patient_store();
        store
            .expect_list_pending()
            .returning(|| Ok(pending(&["boom", "ok"])));
        store
            .expect_mark_failed()
            .withf(|id, message| id == "boom" && message.starts_with("submission aborted"))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_mark_synced()
            .withf(|id, _| id == "ok")
            .times(1)
            .returning(|_, _| Ok(()));

        let executor = SyncExecutor::new(Arc::new(store), Arc::new(PanickingClient));
        let result = executor.run().await;

        assert_eq!((result.succeeded, result.failed), (1, 1));
    }

    /// Client that never answers
    struct HangingClient;

    #[async_trait::async_trait]
    impl RemoteSyncClient for HangingClient {
        async fn submit(&self, _entity: EntityType, _record: &SyncableRecord) -> SubmitOutcome {
            std::future::pending().await
        }
    }

    // Test 7: A hung submission times out instead of stalling the pass
    #[tokio::test]
    async fn test_submit_timeout() {
        let mut store = patient_store();
        store.expect_list_pending().returning(|| Ok(pending(&["slow"])));
        store
            .expect_mark_failed()
            .withf(|id, message| id == "slow" && message == "Network timeout")
            .times(1)
            .returning(|_, _| Ok(()));

        let executor = SyncExecutor::new(Arc::new(store), Arc::new(HangingClient))
            .with_submit_timeout(Duration::from_millis(50));
        let result = executor.run().await;

        assert_eq!(result.failed, 1);
    }

    // Test 8: Only outcomes that were written count toward the result
    #[tokio::test]
    async fn test_counts_only_recorded_outcomes() {
        let mut store = patient_store();
        store
            .expect_list_pending()
            .returning(|| Ok(pending(&["a", "b", "c"])));
        store
            .expect_mark_synced()
            .withf(|id, _| id == "a")
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_mark_failed()
            .withf(|id, _| id == "b")
            .times(1)
            .returning(|_, _| Err(StoreError::Serialization("disk full".to_string())));

        let mut client = MockRemoteSyncClient::new();
        client
            .expect_submit()
            .withf(|_, record| record.local_id == "a")
            .times(1)
            .returning(|_, _| SubmitOutcome::Accepted(ServerRef::new("1")));
        client
            .expect_submit()
            .withf(|_, record| record.local_id == "b")
            .times(1)
            .returning(|_, _| SubmitOutcome::Rejected("invalid".to_string()));

        let executor = SyncExecutor::new(Arc::new(store), Arc::new(client));
        let result = executor.run().await;

        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 0);
        assert_eq!(result.aborted.as_deref(), Some("Serialization error: disk full"));
    }
}
