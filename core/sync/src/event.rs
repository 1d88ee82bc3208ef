//! Sync lifecycle events and the broadcast bus that carries them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use edgeclass_storage::{OutboxStats, Projection};

use crate::transport::{ConflictInfo, FailureKind};

/// Why a cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
}

/// Lifecycle event emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    SyncStarted,
    SyncSkipped {
        reason: SkipReason,
    },
    SyncProgress {
        total: usize,
        current: usize,
        success_count: usize,
        fail_count: usize,
    },
    ItemSynced {
        entry_id: u64,
        endpoint: String,
        projection: Projection,
    },
    ItemFailed {
        entry_id: u64,
        endpoint: String,
        retry_count: u32,
        error: String,
        kind: FailureKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        conflict: Option<ConflictInfo>,
    },
    ItemRetryScheduled {
        entry_id: u64,
        endpoint: String,
        retry_count: u32,
        /// Backoff in milliseconds.
        delay: u64,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    SyncCompleted {
        items_count: usize,
        success_count: usize,
        fail_count: usize,
    },
    SyncError {
        error: String,
    },
}

impl SyncEvent {
    /// Wire name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStarted => "sync_started",
            SyncEvent::SyncSkipped { .. } => "sync_skipped",
            SyncEvent::SyncProgress { .. } => "sync_progress",
            SyncEvent::ItemSynced { .. } => "item_synced",
            SyncEvent::ItemFailed { .. } => "item_failed",
            SyncEvent::ItemRetryScheduled { .. } => "item_retry_scheduled",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::SyncError { .. } => "sync_error",
        }
    }
}

/// An event plus the outbox counts right after it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncUpdate {
    pub event: SyncEvent,
    /// `None` when the store could not be read.
    pub stats: Option<OutboxStats>,
    pub at: DateTime<Utc>,
}

/// Broadcast channel of [`SyncUpdate`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncUpdate>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Having none is not an error.
    pub fn publish(&self, update: SyncUpdate) {
        debug!(event = update.event.name(), "Sync event");
        let _ = self.tx.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.tx.subscribe()
    }

    /// Call `listener` for every update on its own task.
    ///
    /// A panicking listener ends only its own subscription. Dropping the
    /// returned handle unsubscribes.
    pub fn subscribe_fn<F>(&self, listener: F) -> Subscription
    where
        F: Fn(SyncUpdate) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => listener(update),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Sync listener lagged {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Handle for a listener registered with [`EventBus::subscribe_fn`].
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    /// Whether the listener task is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
