//! Aggregated sync status for display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use edgeclass_common::Result;
use edgeclass_storage::{LocalStore, OutboxStats};

use crate::engine::{SyncEngine, SyncOutcome};
use crate::event::{SyncEvent, SyncUpdate};
use crate::network::NetworkState;
use crate::transport::{FailureKind, RemoteApi};

/// Snapshot of everything a status indicator needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub stats: OutboxStats,
    pub last_event: Option<SyncEvent>,
    /// Set by an authentication failure, cleared by the next delivered item.
    pub auth_required: bool,
    pub updated_at: DateTime<Utc>,
}

impl SyncStatus {
    /// Apply one engine update.
    pub fn apply(&mut self, update: &SyncUpdate) {
        match &update.event {
            SyncEvent::SyncStarted => self.is_syncing = true,
            SyncEvent::SyncCompleted { .. } | SyncEvent::SyncError { .. } => {
                self.is_syncing = false
            }
            SyncEvent::ItemFailed {
                kind: FailureKind::Auth,
                ..
            } => self.auth_required = true,
            SyncEvent::ItemSynced { .. } => self.auth_required = false,
            _ => {}
        }
        if let Some(stats) = update.stats {
            self.stats = stats;
        }
        self.last_event = Some(update.event.clone());
        self.updated_at = update.at;
    }

    /// Whether anything is still waiting to be delivered.
    pub fn has_pending(&self) -> bool {
        self.stats.pending > 0
    }
}

/// Keeps a [`SyncStatus`] current from engine events, network changes
/// and a low-frequency poll.
pub struct SyncStatusObserver<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> {
    engine: Arc<SyncEngine<S, R>>,
    status: watch::Receiver<SyncStatus>,
    task: JoinHandle<()>,
}

impl<S, R> SyncStatusObserver<S, R>
where
    S: LocalStore + ?Sized + 'static,
    R: RemoteApi + ?Sized + 'static,
{
    /// Start observing `engine`.
    ///
    /// # Errors
    /// - The initial stats cannot be read
    pub async fn spawn(engine: Arc<SyncEngine<S, R>>, poll_interval: Duration) -> Result<Self> {
        let initial = SyncStatus {
            is_online: engine.oracle().is_online(),
            is_syncing: engine.is_syncing(),
            stats: engine.stats().await?,
            last_event: None,
            auth_required: false,
            updated_at: engine.clock().now(),
        };
        let (tx, status) = watch::channel(initial);

        let updates = engine.subscribe();
        let network = engine.oracle().subscribe();
        let task = tokio::spawn(observe(engine.clone(), tx, updates, network, poll_interval));

        Ok(Self {
            engine,
            status,
            task,
        })
    }

    pub fn current(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Ask the engine for a cycle now.
    pub async fn trigger_sync(&self) -> Result<SyncOutcome> {
        self.engine.sync_all().await
    }
}

impl<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> Drop for SyncStatusObserver<S, R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn observe<S, R>(
    engine: Arc<SyncEngine<S, R>>,
    tx: watch::Sender<SyncStatus>,
    mut updates: broadcast::Receiver<SyncUpdate>,
    mut network: watch::Receiver<NetworkState>,
    poll_interval: Duration,
) where
    S: LocalStore + ?Sized + 'static,
    R: RemoteApi + ?Sized + 'static,
{
    // Catch up on anything that changed before the task first ran.
    let online = network.borrow_and_update().is_online;
    set_online(&engine, &tx, online);

    let mut poll = interval_at(Instant::now() + poll_interval, poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    tx.send_modify(|s| s.apply(&update));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Status observer lagged {n} events");
                    refresh(&engine, &tx).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            changed = network.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = network.borrow_and_update().is_online;
                set_online(&engine, &tx, online);
            }

            _ = poll.tick() => {
                debug!("Polling sync status");
                refresh(&engine, &tx).await;
            }
        }
    }
}

fn set_online<S, R>(engine: &SyncEngine<S, R>, tx: &watch::Sender<SyncStatus>, online: bool)
where
    S: LocalStore + ?Sized,
    R: RemoteApi + ?Sized,
{
    let at = engine.clock().now();
    tx.send_if_modified(|s| {
        let changed = s.is_online != online;
        s.is_online = online;
        if changed {
            s.updated_at = at;
        }
        changed
    });
}

async fn refresh<S, R>(engine: &SyncEngine<S, R>, tx: &watch::Sender<SyncStatus>)
where
    S: LocalStore + ?Sized,
    R: RemoteApi + ?Sized,
{
    let stats = match engine.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(error = %e, "Could not read outbox stats");
            None
        }
    };
    let online = engine.oracle().is_online();
    let syncing = engine.is_syncing();
    let at = engine.clock().now();

    tx.send_if_modified(|s| {
        let before = (s.is_online, s.is_syncing, s.stats);
        s.is_online = online;
        s.is_syncing = syncing;
        if let Some(stats) = stats {
            s.stats = stats;
        }
        let changed = before != (s.is_online, s.is_syncing, s.stats);
        if changed {
            s.updated_at = at;
        }
        changed
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use crate::transport::MockResponse;

    async fn wait_for<F>(rx: &mut watch::Receiver<SyncStatus>, mut condition: F) -> SyncStatus
    where
        F: FnMut(&SyncStatus) -> bool,
    {
        let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| condition(s)))
            .await
            .expect("status not reached")
            .expect("observer stopped");
        status.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_snapshot() {
        let h = Harness::new();
        h.enqueue_quiz("quiz_1").await;

        let observer = SyncStatusObserver::spawn(h.engine.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        let status = observer.current();
        assert!(status.is_online);
        assert!(!status.is_syncing);
        assert_eq!(status.stats.pending, 1);
        assert!(status.has_pending());
        assert!(status.last_event.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_sync_events() {
        let h = Harness::new();
        h.enqueue_quiz("quiz_1").await;
        let observer = SyncStatusObserver::spawn(h.engine.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        let mut rx = observer.subscribe();

        observer.trigger_sync().await.unwrap();

        let status = wait_for(&mut rx, |s| {
            matches!(s.last_event, Some(SyncEvent::SyncCompleted { .. }))
        })
        .await;
        assert!(!status.is_syncing);
        assert_eq!(status.stats.synced, 1);
        assert_eq!(status.stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_change_updates_status() {
        let h = Harness::new();
        let observer = SyncStatusObserver::spawn(h.engine.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        let mut rx = observer.subscribe();

        h.oracle.set_online(false);
        let status = wait_for(&mut rx, |s| !s.is_online).await;
        assert!(!status.is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_before_first_poll_is_not_lost() {
        let h = Harness::new();
        let observer = SyncStatusObserver::spawn(h.engine.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        h.oracle.set_online(false);
        h.oracle.set_online(true);
        h.oracle.set_online(false);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!observer.current().is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_raises_flag_until_next_success() {
        let h = Harness::new();
        h.enqueue_quiz("quiz_1").await;
        h.remote.push_response("/sync/quizzes", MockResponse::Status(401));
        let observer = SyncStatusObserver::spawn(h.engine.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        let mut rx = observer.subscribe();

        observer.trigger_sync().await.unwrap();
        let status = wait_for(&mut rx, |s| {
            matches!(s.last_event, Some(SyncEvent::SyncCompleted { .. }))
        })
        .await;
        assert!(status.auth_required);
        assert_eq!(status.stats.failed, 1);

        h.enqueue_quiz("quiz_2").await;
        observer.trigger_sync().await.unwrap();
        let status = wait_for(&mut rx, |s| {
            matches!(s.last_event, Some(SyncEvent::SyncCompleted { .. })) && s.stats.synced == 1
        })
        .await;
        assert!(!status.auth_required);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_picks_up_changes_without_events() {
        let h = Harness::new();
        let observer = SyncStatusObserver::spawn(h.engine.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        let mut rx = observer.subscribe();
        assert_eq!(observer.current().stats.pending, 0);

        h.enqueue_quiz("quiz_1").await;
        tokio::time::sleep(Duration::from_secs(61)).await;

        let status = wait_for(&mut rx, |s| s.stats.pending == 1).await;
        assert_eq!(status.stats.total, 1);
    }
}
