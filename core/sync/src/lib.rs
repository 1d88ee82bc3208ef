//! EdgeClass Sync Engine
//!
//! Delivers locally queued mutations to the sync server:
//! - Batched, connection-adaptive dispatch of outbox entries
//! - Retry with exponential backoff and a terminal failure ceiling
//! - Network quality detection and lite mode
//! - Lifecycle events and an aggregated status snapshot
//! - Background scheduling of retry sweeps and full syncs

pub mod config;
pub mod engine;
pub mod event;
pub mod network;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncOutcome, SyncResult};
pub use event::{EventBus, SkipReason, Subscription, SyncEvent, SyncUpdate};
pub use network::{
    ConnectionProbe, EffectiveType, HttpThroughputProbe, NetworkInfo, NetworkOracle,
    NetworkState, ProbeReading,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use status::{SyncStatus, SyncStatusObserver};
pub use transport::{
    ConflictInfo, DispatchAck, DispatchError, FailureKind, HttpRemote, MockRemote, MockResponse,
    RemoteApi,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let config = SyncConfig::default();
        let _policy: RetryPolicy = config.retry_policy();
        let _oracle = NetworkOracle::new();
        let _bus = EventBus::new(config.event_capacity);
        assert_eq!(EffectiveType::FourG.batch_size(), 5);
    }
}
