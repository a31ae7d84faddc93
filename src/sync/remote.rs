//! Remote sync client
//!
//! Maps one local record to one request against the remote registration
//! service and classifies the answer. The client never touches the record
//! store; recording the outcome is the executor's job.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::{RemoteConfig, SharedRemoteConfig};
use crate::error::SyncError;
use crate::models::{EntityType, ServerRef, SyncableRecord};

/// Header carrying the `<entity>:<local_id>` key of the submitted record
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Classified result of submitting one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The remote service stored the record and assigned identifiers
    Accepted(ServerRef),
    /// Structured business failure (`success: false`)
    Rejected(String),
    /// No structured answer: timeout, refused connection, bare HTTP error
    TransportFailure(String),
}

impl SubmitOutcome {
    /// Diagnostic message for failed outcomes
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Accepted(_) => None,
            SubmitOutcome::Rejected(msg) | SubmitOutcome::TransportFailure(msg) => Some(msg),
        }
    }
}

/// Client submitting local records to the remote service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    /// Submit one record and classify the response
    async fn submit(&self, entity: EntityType, record: &SyncableRecord) -> SubmitOutcome;
}

/// Response envelope returned by every endpoint
#[derive(Debug, Deserialize)]
struct RemoteResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// reqwest-backed remote client with request limiting
///
/// Features:
/// - Remote configuration re-read on every submission
/// - Global concurrent request limiting via semaphore
/// - Per-host minimum interval between requests
/// - Idempotency key and optional bearer token on every request
pub struct HttpRemoteClient {
    client: Client,
    config: SharedRemoteConfig,
    semaphore: Arc<Semaphore>,
    last_request: Arc<Mutex<HashMap<String, Instant>>>,
}

impl HttpRemoteClient {
    /// Create a client; the concurrency limit is taken from the current config
    pub async fn new(config: SharedRemoteConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, config).await)
    }

    /// Create a client around a custom reqwest Client
    pub async fn with_client(client: Client, config: SharedRemoteConfig) -> Self {
        let max_concurrent = config.snapshot().await.max_concurrent.max(1);
        Self {
            client,
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            last_request: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of free request slots
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn post_record(
        &self,
        entity: EntityType,
        record: &SyncableRecord,
    ) -> Result<SubmitOutcome, SyncError> {
        let config = self.config.snapshot().await;
        let url = endpoint_url(&config, entity);

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SyncError::Network("request limiter closed".to_string()))?;

        self.wait_for_rate_limit(&url, config.min_interval_ms).await;

        debug!(url = %url, entity = %entity, local_id = %record.local_id, "Sending record");

        let mut request = self
            .client
            .post(&url)
            .timeout(config.request_timeout())
            .header(IDEMPOTENCY_HEADER, record.key())
            .json(&record.payload);
        if let Some(token) = &config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(url = %url, status = status.as_u16(), "Credentials rejected");
            return Err(SyncError::Unauthorized(status.as_u16()));
        }

        let body = response.text().await?;
        classify_response(entity, status, &body)
    }

    /// Wait for the minimum interval to pass for the URL's host
    async fn wait_for_rate_limit(&self, url: &str, min_interval_ms: u64) {
        if min_interval_ms == 0 {
            return;
        }
        let domain = extract_domain(url);
        let min_interval = std::time::Duration::from_millis(min_interval_ms);

        let mut last_requests = self.last_request.lock().await;

        if let Some(last) = last_requests.get(&domain) {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                let wait_time = min_interval - elapsed;
                debug!(
                    domain = domain,
                    wait_ms = wait_time.as_millis(),
                    "Waiting for request interval"
                );
                drop(last_requests);
                tokio::time::sleep(wait_time).await;
                last_requests = self.last_request.lock().await;
            }
        }

        last_requests.insert(domain, Instant::now());
    }
}

#[async_trait]
impl RemoteSyncClient for HttpRemoteClient {
    async fn submit(&self, entity: EntityType, record: &SyncableRecord) -> SubmitOutcome {
        match self.post_record(entity, record).await {
            Ok(outcome) => outcome,
            Err(err) => SubmitOutcome::TransportFailure(err.to_string()),
        }
    }
}

/// Full URL of an entity's endpoint under the configured base URL
fn endpoint_url(config: &RemoteConfig, entity: EntityType) -> String {
    let path = config
        .endpoints
        .get(entity.as_str())
        .map(String::as_str)
        .unwrap_or_else(|| entity.default_endpoint());
    format!(
        "{}/{}",
        config.base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn classify_response(
    entity: EntityType,
    status: StatusCode,
    body: &str,
) -> Result<SubmitOutcome, SyncError> {
    match serde_json::from_str::<RemoteResponse>(body) {
        Ok(parsed) if !parsed.success => {
            let message = parsed
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| format!("rejected with HTTP {}", status.as_u16()));
            Ok(SubmitOutcome::Rejected(message))
        }
        Ok(parsed) if status.is_success() => {
            extract_server_ref(entity, parsed.data.as_ref()).map(SubmitOutcome::Accepted)
        }
        Ok(_) => Err(SyncError::ServerError(status.as_u16())),
        Err(_) if status.is_success() => Err(SyncError::InvalidResponse(format!(
            "unparseable body from {} endpoint",
            entity
        ))),
        Err(_) => Err(SyncError::ServerError(status.as_u16())),
    }
}

fn extract_server_ref(entity: EntityType, data: Option<&Value>) -> Result<ServerRef, SyncError> {
    let data = data.ok_or_else(|| SyncError::InvalidResponse("missing data".to_string()))?;

    let server_id = identifier(data, entity.server_id_field())
        .or_else(|| identifier(data, "id"))
        .ok_or_else(|| {
            SyncError::InvalidResponse(format!(
                "missing {} in response data",
                entity.server_id_field()
            ))
        })?;

    let server_ref = entity
        .server_ref_field()
        .and_then(|field| identifier(data, field));

    Ok(ServerRef {
        server_id,
        server_ref,
    })
}

/// String form of an identifier field; numbers are stringified
fn identifier(data: &Value, field: &str) -> Option<String> {
    match data.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract domain from URL for rate limiting purposes
fn extract_domain(url: &str) -> String {
    url.split("://")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or(url)
        .to_string()
}
