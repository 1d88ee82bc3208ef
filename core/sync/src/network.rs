//! Network quality oracle.
//!
//! Tracks connectivity and a coarse bandwidth class, and turns them into the
//! batch size and pacing the engine should use. A manual lite mode forces
//! 2g behavior regardless of what is detected.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use edgeclass_common::{Error, Result};
use edgeclass_storage::SettingsStore;

/// Settings key under which lite mode is persisted.
pub const LITE_MODE_SETTING: &str = "lite_mode";

/// Coarse connection class, as reported by browsers' Network Information API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl EffectiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveType::Slow2g => "slow-2g",
            EffectiveType::TwoG => "2g",
            EffectiveType::ThreeG => "3g",
            EffectiveType::FourG => "4g",
        }
    }

    /// Entries dispatched concurrently per batch.
    pub fn batch_size(&self) -> usize {
        match self {
            EffectiveType::Slow2g | EffectiveType::TwoG => 2,
            EffectiveType::ThreeG => 3,
            EffectiveType::FourG => 5,
        }
    }

    /// Pause between batches within one cycle.
    pub fn batch_delay(&self) -> Duration {
        match self {
            EffectiveType::Slow2g => Duration::from_secs(60),
            EffectiveType::TwoG => Duration::from_secs(30),
            EffectiveType::ThreeG => Duration::from_secs(15),
            EffectiveType::FourG => Duration::from_secs(5),
        }
    }

    /// Period of the safety-net full sync.
    pub fn full_sync_interval(&self) -> Duration {
        match self {
            EffectiveType::Slow2g => Duration::from_secs(30 * 60),
            EffectiveType::TwoG => Duration::from_secs(15 * 60),
            EffectiveType::ThreeG => Duration::from_secs(10 * 60),
            EffectiveType::FourG => Duration::from_secs(5 * 60),
        }
    }

    pub fn is_slow(&self) -> bool {
        matches!(self, EffectiveType::Slow2g | EffectiveType::TwoG)
    }

    /// Bucket a measured throughput in KB/s.
    pub fn from_throughput_kbps(kbps: f64) -> Self {
        if kbps < 10.0 {
            EffectiveType::Slow2g
        } else if kbps < 50.0 {
            EffectiveType::TwoG
        } else if kbps < 250.0 {
            EffectiveType::ThreeG
        } else {
            EffectiveType::FourG
        }
    }
}

impl fmt::Display for EffectiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EffectiveType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "slow-2g" => Ok(EffectiveType::Slow2g),
            "2g" => Ok(EffectiveType::TwoG),
            "3g" => Ok(EffectiveType::ThreeG),
            "4g" => Ok(EffectiveType::FourG),
            other => Err(Error::InvalidInput(format!(
                "Unknown connection type: {}",
                other
            ))),
        }
    }
}

/// Raw oracle state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkState {
    pub is_online: bool,
    pub detected: EffectiveType,
    pub downlink_mbps: Option<f64>,
    pub lite_mode: bool,
}

impl NetworkState {
    /// Class the engine should behave as.
    pub fn effective(&self) -> EffectiveType {
        if self.lite_mode {
            EffectiveType::TwoG
        } else {
            self.detected
        }
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            is_online: true,
            detected: EffectiveType::FourG,
            downlink_mbps: None,
            lite_mode: false,
        }
    }
}

/// Derived view of the network, as consumed by the engine and the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    pub effective_type: EffectiveType,
    pub detected_type: EffectiveType,
    pub downlink_mbps: Option<f64>,
    pub is_online: bool,
    pub is_lite_mode: bool,
    pub is_slow: bool,
    pub batch_size: usize,
    /// Inter-batch delay.
    pub sync_interval: Duration,
    pub full_sync_interval: Duration,
}

impl From<NetworkState> for NetworkInfo {
    fn from(state: NetworkState) -> Self {
        let effective = state.effective();
        Self {
            effective_type: effective,
            detected_type: state.detected,
            downlink_mbps: state.downlink_mbps,
            is_online: state.is_online,
            is_lite_mode: state.lite_mode,
            is_slow: effective.is_slow(),
            batch_size: effective.batch_size(),
            sync_interval: effective.batch_delay(),
            full_sync_interval: effective.full_sync_interval(),
        }
    }
}

/// Result of one connection measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReading {
    pub effective_type: EffectiveType,
    pub downlink_mbps: Option<f64>,
}

/// Source of connection quality measurements.
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    /// Measure the current connection.
    ///
    /// # Errors
    /// - The server cannot be reached; the device is treated as offline
    async fn measure(&self) -> Result<ProbeReading>;
}

/// Measures throughput by timing the download of a small fixed resource.
pub struct HttpThroughputProbe {
    http: Client,
    url: Url,
    timeout: Duration,
}

impl HttpThroughputProbe {
    /// Probe `url` with the given timeout.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidInput(format!("Invalid probe URL {}: {}", url, e)))?;
        Ok(Self {
            http: Client::new(),
            url,
            timeout,
        })
    }
}

#[async_trait]
impl ConnectionProbe for HttpThroughputProbe {
    async fn measure(&self) -> Result<ProbeReading> {
        let started = Instant::now();
        let response = self
            .http
            .get(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Probe failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "Probe failed: HTTP {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("Probe failed: {}", e)))?;
        let secs = started.elapsed().as_secs_f64().max(0.001);
        let kbps = body.len() as f64 / 1024.0 / secs;

        debug!(bytes = body.len(), secs, kbps, "Throughput probe finished");
        Ok(ProbeReading {
            effective_type: EffectiveType::from_throughput_kbps(kbps),
            downlink_mbps: Some(kbps * 8.0 / 1000.0),
        })
    }
}

/// Current connectivity and bandwidth class, with change notification.
pub struct NetworkOracle {
    state: watch::Sender<NetworkState>,
    settings: Option<Arc<dyn SettingsStore>>,
}

impl NetworkOracle {
    /// Create an oracle that starts online on a fast connection.
    pub fn new() -> Self {
        Self::with_state(NetworkState::default())
    }

    pub fn with_state(initial: NetworkState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            settings: None,
        }
    }

    /// Attach a settings store and restore the persisted lite mode.
    pub async fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Result<Self> {
        let lite_mode = settings
            .get_setting(LITE_MODE_SETTING)
            .await?
            .is_some_and(|v| v == "true");
        self.state.send_modify(|s| s.lite_mode = lite_mode);
        self.settings = Some(settings);
        Ok(self)
    }

    pub fn state(&self) -> NetworkState {
        *self.state.borrow()
    }

    pub fn network_info(&self) -> NetworkInfo {
        self.state().into()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    /// Receive a notification on every change, detected or manual.
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|s| {
            let changed = s.is_online != online;
            s.is_online = online;
            changed
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    /// Report a connection class from a platform API.
    pub fn report_connection(&self, effective_type: EffectiveType, downlink_mbps: Option<f64>) {
        let changed = self.state.send_if_modified(|s| {
            let changed = s.detected != effective_type || s.downlink_mbps != downlink_mbps;
            s.detected = effective_type;
            s.downlink_mbps = downlink_mbps;
            changed
        });
        if changed {
            debug!(%effective_type, ?downlink_mbps, "Connection class changed");
        }
    }

    /// Measure with `probe` and record the result.
    ///
    /// A failed probe keeps the previous class and marks the device offline.
    pub async fn probe(&self, probe: &dyn ConnectionProbe) -> NetworkInfo {
        match probe.measure().await {
            Ok(reading) => {
                self.report_connection(reading.effective_type, reading.downlink_mbps);
                self.set_online(true);
            }
            Err(e) => {
                warn!(error = %e, "Connection probe failed");
                self.set_online(false);
            }
        }
        self.network_info()
    }

    /// Enable or disable lite mode, persisting the choice when possible.
    pub async fn set_lite_mode(&self, enabled: bool) -> Result<()> {
        if let Some(settings) = &self.settings {
            settings
                .put_setting(LITE_MODE_SETTING, if enabled { "true" } else { "false" })
                .await?;
        }
        self.state.send_if_modified(|s| {
            let changed = s.lite_mode != enabled;
            s.lite_mode = enabled;
            changed
        });
        info!(enabled, "Lite mode set");
        Ok(())
    }

    /// Flip lite mode and return the new value.
    pub async fn toggle_lite_mode(&self) -> Result<bool> {
        let enabled = !self.state.borrow().lite_mode;
        self.set_lite_mode(enabled).await?;
        Ok(enabled)
    }
}

impl Default for NetworkOracle {
    fn default() -> Self {
        Self::new()
    }
}
