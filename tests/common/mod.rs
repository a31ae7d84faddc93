//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clinic_sync::config::{RemoteConfig, RetentionConfig, SchedulerSettings, SharedRemoteConfig};
use clinic_sync::models::{ConnectivityState, EntityType, Transport};
use clinic_sync::store::{RecordStore, SqliteDatabase, SqliteRecordStore};
use clinic_sync::sync::{ConnectivityMonitor, EngineOptions, HttpRemoteClient, SyncEngine};

/// Engine wired to a file-backed database and a mock remote service
pub struct TestEnv {
    pub dir: TempDir,
    pub server: MockServer,
    pub database: SqliteDatabase,
    pub monitor: Arc<ConnectivityMonitor>,
    pub engine: SyncEngine,
}

impl TestEnv {
    /// Store for direct inspection of one entity type
    pub fn store(&self, entity: EntityType) -> SqliteRecordStore {
        self.database.store(entity)
    }

    /// Number of requests the mock server has seen
    pub async fn request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }

    /// JSON bodies of every request received, in arrival order
    pub async fn request_bodies(&self) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| serde_json::from_slice(&request.body).unwrap_or(Value::Null))
            .collect()
    }
}

/// Remote configuration pointing at the mock server
pub fn create_test_remote_config(server: &MockServer) -> RemoteConfig {
    RemoteConfig {
        base_url: server.uri(),
        request_timeout_secs: 1,
        ..RemoteConfig::default()
    }
}

/// Scheduler settings with the platform minimum interval and no debounce
pub fn create_test_scheduler_settings() -> SchedulerSettings {
    SchedulerSettings {
        manual_debounce_ms: 0,
        ..SchedulerSettings::default()
    }
}

/// Create a test environment with the given initial connectivity
pub async fn create_test_env(initial: ConnectivityState) -> TestEnv {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("clinic-sync.db");
    let database = SqliteDatabase::new(db_path.to_str().expect("Non UTF-8 temp path"))
        .await
        .expect("Failed to create test database");

    let server = MockServer::start().await;
    let remote = SharedRemoteConfig::new(create_test_remote_config(&server));
    let client = Arc::new(
        HttpRemoteClient::new(remote.clone())
            .await
            .expect("Failed to create remote client"),
    );
    let monitor = Arc::new(ConnectivityMonitor::new(initial));

    let stores: Vec<Arc<dyn RecordStore>> = database
        .stores()
        .into_iter()
        .map(|s| Arc::new(s) as Arc<dyn RecordStore>)
        .collect();

    let engine = SyncEngine::new(
        stores,
        client,
        monitor.clone(),
        remote,
        EngineOptions {
            retention: RetentionConfig {
                synced_retention_days: 0,
            },
            submit_timeout: Duration::from_secs(5),
        },
    );

    TestEnv {
        dir,
        server,
        database,
        monitor,
        engine,
    }
}

/// Online test environment on Wi-Fi
pub async fn create_online_env() -> TestEnv {
    create_test_env(ConnectivityState::online(Transport::Wifi)).await
}

/// Patient payload as the registration form produces it
pub fn patient_payload(first_name: &str) -> Value {
    json!({
        "first_name": first_name,
        "last_name": "Mensah",
        "date_of_birth": "1990-04-12",
        "sex": "female"
    })
}

/// Vitals payload
pub fn vitals_payload(patient_id: &str) -> Value {
    json!({
        "patient_id": patient_id,
        "height_cm": 165.0,
        "weight_kg": 70.5
    })
}

/// Successful response for `entity` with server id `id`
pub fn accepted_body(entity: EntityType, id: u64) -> Value {
    let mut data = serde_json::Map::new();
    data.insert(entity.server_id_field().to_string(), json!(id));
    if let Some(field) = entity.server_ref_field() {
        data.insert(field.to_string(), json!(format!("REF-{:04}", id)));
    }
    json!({ "success": true, "message": "Created", "data": data })
}

/// Accept every submission to the endpoint of `entity`
pub async fn mount_accept_all(server: &MockServer, entity: EntityType) {
    Mock::given(method("POST"))
        .and(path(entity.default_endpoint()))
        .respond_with(ResponseTemplate::new(201).set_body_json(accepted_body(entity, 1)))
        .mount(server)
        .await;
}

/// Wait until `condition` holds or `limit` elapses
pub async fn wait_for<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}
