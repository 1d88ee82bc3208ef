//! Remote API transport for outbox dispatch.
//!
//! The engine only needs one operation from the server: deliver a single
//! outbox entry and report how it went. [`HttpRemote`] talks to the real sync
//! server; [`MockRemote`] replays scripted responses for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use edgeclass_common::{DeviceId, Error, Result};
use edgeclass_storage::{OutboxEntry, SyncMethod};

/// Header carrying the authoring device on every dispatch.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Coarse classification of a dispatch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, connection error, 5xx, 408, 429. Retried with backoff.
    Transient,
    /// 400 or 422. The payload will never be accepted as-is.
    Validation,
    /// 401 or 403. Surfaced so the user can re-authenticate.
    Auth,
    /// 409. The server holds a newer version of the record.
    Conflict,
    /// Any other client error.
    Rejected,
}

impl FailureKind {
    /// Classify an HTTP status that is not a success.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 429 | 500..=599 => FailureKind::Transient,
            400 | 422 => FailureKind::Validation,
            401 | 403 => FailureKind::Auth,
            409 => FailureKind::Conflict,
            _ => FailureKind::Rejected,
        }
    }
}

/// Timestamps returned by the server when it rejects a stale write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub server_updated_at: Option<DateTime<Utc>>,
    pub client_updated_at: Option<DateTime<Utc>>,
}

/// Why a single dispatch did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Conflict: server has a newer version")]
    Conflict(ConflictInfo),
}

impl DispatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DispatchError::Timeout(_) | DispatchError::Connection(_) => FailureKind::Transient,
            DispatchError::Http { status, .. } => FailureKind::from_status(*status),
            DispatchError::Conflict(_) => FailureKind::Conflict,
        }
    }

    /// Whether backing off and resending the same payload can succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Conflict metadata, if this is a conflict.
    pub fn conflict(&self) -> Option<&ConflictInfo> {
        match self {
            DispatchError::Conflict(info) => Some(info),
            _ => None,
        }
    }
}

/// Successful delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchAck {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Delivery of outbox entries to the sync server.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Send one entry.
    ///
    /// # Postconditions
    /// - `Ok` only for a 2xx response
    ///
    /// # Errors
    /// - Every non-2xx response and transport failure, classified
    async fn send(&self, entry: &OutboxEntry) -> std::result::Result<DispatchAck, DispatchError>;
}

/// HTTP transport against the sync server.
pub struct HttpRemote {
    http: Client,
    base_url: Url,
}

impl HttpRemote {
    /// Create a transport for the server at `base_url`.
    ///
    /// # Errors
    /// - `base_url` is not an absolute URL
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), base_url)
    }

    /// Create a transport with a preconfigured client.
    pub fn with_client(http: Client, base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid server URL {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    /// Resolve an outbox endpoint against the server base URL.
    pub fn url_for(&self, endpoint: &str) -> Result<Url> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", endpoint, e)))
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn send(&self, entry: &OutboxEntry) -> std::result::Result<DispatchAck, DispatchError> {
        let url = self.url_for(&entry.endpoint).map_err(|e| DispatchError::Http {
            status: 400,
            message: e.to_string(),
        })?;

        let request = match entry.method {
            SyncMethod::Create | SyncMethod::Update => self
                .http
                .post(url)
                .header(header::CONTENT_TYPE, "application/json")
                .body(entry.payload.clone()),
            SyncMethod::Delete => self.http.delete(url),
        };

        let response = request
            .header(DEVICE_ID_HEADER, entry.owner_device.as_str())
            .send()
            .await
            .map_err(|e| DispatchError::Connection(e.to_string()))?;

        let status = response.status();
        debug!(entry = entry.id, status = status.as_u16(), "Dispatch response");

        if status.is_success() {
            let body = response.json().await.unwrap_or(serde_json::Value::Null);
            return Ok(DispatchAck {
                status: status.as_u16(),
                body,
            });
        }

        if status == StatusCode::CONFLICT {
            let info = response.json::<ConflictInfo>().await.unwrap_or_default();
            return Err(DispatchError::Conflict(info));
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(text);
        Err(DispatchError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

/// Scripted response for [`MockRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    /// 200 with `{"success": true}`.
    Ok,
    /// Non-success HTTP status.
    Status(u16),
    /// 409 with conflict timestamps.
    Conflict(ConflictInfo),
    /// Connection refused.
    Unreachable,
    /// Never answers; the engine's timeout fires.
    Hang,
}

/// A dispatch observed by [`MockRemote`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub entry_id: u64,
    pub endpoint: String,
    pub method: SyncMethod,
    pub device: DeviceId,
    pub at: Instant,
}

/// In-memory remote for testing.
///
/// Responses are scripted per endpoint and consumed in order; once an
/// endpoint's script is empty the default response is used.
#[derive(Debug)]
pub struct MockRemote {
    scripts: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    fallback: Mutex<MockResponse>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockRemote {
    /// Create a remote that accepts everything.
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: Mutex::new(MockResponse::Ok),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a response for the next call to `endpoint`.
    pub fn push_response(&self, endpoint: &str, response: MockResponse) {
        lock(&self.scripts)
            .entry(endpoint.to_string())
            .or_default()
            .push_back(response);
    }

    /// Response used when no script applies.
    pub fn set_default(&self, response: MockResponse) {
        *lock(&self.fallback) = response;
    }

    /// Every call seen so far, in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Highest number of dispatches that were in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self, endpoint: &str) -> MockResponse {
        lock(&self.scripts)
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| lock(&self.fallback).clone())
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn send(&self, entry: &OutboxEntry) -> std::result::Result<DispatchAck, DispatchError> {
        lock(&self.calls).push(RecordedCall {
            entry_id: entry.id,
            endpoint: entry.endpoint.clone(),
            method: entry.method,
            device: entry.owner_device.clone(),
            at: Instant::now(),
        });
        let response = self.next_response(&entry.endpoint);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if response == MockResponse::Hang {
            std::future::pending::<()>().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match response {
            MockResponse::Ok | MockResponse::Hang => Ok(DispatchAck {
                status: 200,
                body: serde_json::json!({ "success": true }),
            }),
            MockResponse::Status(status) => Err(DispatchError::Http {
                status,
                message: StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("Unknown status")
                    .to_string(),
            }),
            MockResponse::Conflict(info) => Err(DispatchError::Conflict(info)),
            MockResponse::Unreachable => {
                Err(DispatchError::Connection("connection refused".to_string()))
            }
        }
    }
}
