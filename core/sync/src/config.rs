//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use edgeclass_common::Result;

use crate::retry::RetryPolicy;

/// Configuration for the sync engine and its background tasks.
///
/// Every field has a default, so a config file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the sync server.
    pub api_base_url: String,
    /// Failed attempts after which an entry is abandoned.
    pub max_retries: u32,
    /// Backoff base; attempt `r` waits `initial_retry_delay * 2^r`.
    #[serde(rename = "initial_retry_delay_ms", with = "duration_ms")]
    pub initial_retry_delay: Duration,
    /// Per-dispatch timeout. Expiry counts as a transient failure.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// How often the scheduler looks for due retries.
    #[serde(rename = "retry_sweep_interval_ms", with = "duration_ms")]
    pub retry_sweep_interval: Duration,
    /// Fallback refresh period of the status observer.
    #[serde(rename = "status_poll_interval_ms", with = "duration_ms")]
    pub status_poll_interval: Duration,
    /// How long synced entries are kept before purging.
    #[serde(rename = "synced_retention_ms", with = "duration_ms")]
    pub synced_retention: Duration,
    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3001".to_string(),
            max_retries: 5,
            initial_retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry_sweep_interval: Duration::from_secs(10),
            status_poll_interval: Duration::from_secs(60),
            synced_retention: Duration::from_secs(7 * 24 * 60 * 60),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - File is not valid JSON for this structure
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Set the server base URL.
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Set the per-dispatch timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Backoff policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries).with_initial_delay(self.initial_retry_delay)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
