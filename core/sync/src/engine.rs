//! Core sync engine that drains the outbox.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use edgeclass_common::{Clock, Result};
use edgeclass_storage::{LocalStore, OutboxEntry, OutboxStats, Projection};

use crate::config::SyncConfig;
use crate::event::{EventBus, SkipReason, Subscription, SyncEvent, SyncUpdate};
use crate::network::NetworkOracle;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::{DispatchError, FailureKind, RemoteApi};

/// Summary of one completed sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    /// Eligible entries at the start of the cycle.
    pub items_count: usize,
    pub items_synced: usize,
    /// Entries that became failed during this cycle.
    pub items_failed: usize,
    pub retries_scheduled: usize,
    pub conflicts_found: usize,
    pub batches: usize,
    pub duration: Duration,
}

impl SyncResult {
    /// Dispatches that did not succeed, whether retried or abandoned.
    pub fn fail_count(&self) -> usize {
        self.items_failed + self.retries_scheduled
    }
}

/// What a call to [`SyncEngine::sync_all`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncResult),
    /// Another cycle was running; nothing was done.
    AlreadyRunning,
    /// The device is offline; nothing was done.
    SkippedOffline,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ItemOutcome {
    Synced,
    RetryScheduled,
    Failed(FailureKind),
}

/// Clears the in-progress flag when dropped, including on unwind.
struct InProgressGuard<'a>(&'a AtomicBool);

impl<'a> InProgressGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Main sync engine: the single driver of outbox delivery on a device.
pub struct SyncEngine<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> {
    /// Local outbox and records.
    store: Arc<S>,
    /// Remote sync API.
    remote: Arc<R>,
    /// Connectivity and batch sizing.
    oracle: Arc<NetworkOracle>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    policy: RetryPolicy,
    config: SyncConfig,
    in_progress: AtomicBool,
}

impl<S: LocalStore + ?Sized, R: RemoteApi + ?Sized> SyncEngine<S, R> {
    /// Create a new sync engine.
    pub fn new(
        store: Arc<S>,
        remote: Arc<R>,
        oracle: Arc<NetworkOracle>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            oracle,
            clock,
            events: EventBus::new(config.event_capacity),
            policy: config.retry_policy(),
            config,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn oracle(&self) -> &Arc<NetworkOracle> {
        &self.oracle
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Receive every update from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.events.subscribe()
    }

    /// Call `listener` for every update until the returned handle is dropped.
    pub fn subscribe_fn<F>(&self, listener: F) -> Subscription
    where
        F: Fn(SyncUpdate) + Send + Sync + 'static,
    {
        self.events.subscribe_fn(listener)
    }

    /// Whether a cycle is running right now.
    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Aggregate outbox counts.
    pub async fn stats(&self) -> Result<OutboxStats> {
        self.store.stats().await
    }

    /// Whether any backed-off entry is now due.
    pub async fn has_due_retries(&self) -> Result<bool> {
        self.store.has_due_retries(self.clock.now()).await
    }

    /// Reset failed entries to pending so the next cycle retries them.
    ///
    /// Retry counts are kept, so each reset buys exactly one more attempt for
    /// entries at the ceiling.
    pub async fn retry_failed(&self) -> Result<usize> {
        let reset = self.store.reset_failed().await?;
        info!(reset, "Failed entries reset to pending");
        Ok(reset)
    }

    /// Delete synced entries older than the retention window.
    pub async fn purge_synced(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.config.synced_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge_synced_older_than(cutoff).await?;
        if purged > 0 {
            info!(purged, "Purged synced outbox entries");
        }
        Ok(purged)
    }

    /// Run one sync cycle.
    ///
    /// Returns immediately if a cycle is already running or the device is
    /// offline. Dispatch failures never abort the cycle; only local store
    /// errors do, after emitting `sync_error`.
    pub async fn sync_all(&self) -> Result<SyncOutcome> {
        if self.is_syncing() {
            debug!("Sync already in progress");
            return Ok(SyncOutcome::AlreadyRunning);
        }

        if !self.oracle.is_online() {
            info!("Offline, skipping sync");
            self.emit(SyncEvent::SyncSkipped {
                reason: SkipReason::Offline,
            })
            .await;
            return Ok(SyncOutcome::SkippedOffline);
        }

        let Some(_guard) = InProgressGuard::acquire(&self.in_progress) else {
            debug!("Sync already in progress");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        self.emit(SyncEvent::SyncStarted).await;

        match self.run_cycle().await {
            Ok(result) => Ok(SyncOutcome::Completed(result)),
            Err(e) => {
                error!(error = %e, "Sync cycle aborted");
                self.emit(SyncEvent::SyncError {
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn run_cycle(&self) -> Result<SyncResult> {
        let started = Instant::now();
        let eligible = self.store.list_eligible(self.clock.now()).await?;

        let mut result = SyncResult {
            items_count: eligible.len(),
            ..Default::default()
        };

        if eligible.is_empty() {
            debug!("Nothing to sync");
            self.emit_completed(&result).await;
            return Ok(result);
        }

        // Re-derived every cycle: the connection may have changed since the last one.
        let network = self.oracle.network_info();
        let batch_size = network.batch_size.max(1);
        let batch_count = eligible.len().div_ceil(batch_size);

        info!(
            items = eligible.len(),
            batch_size,
            connection = %network.effective_type,
            "Starting sync"
        );
        self.emit_progress(&result, 0).await;

        let mut current = 0;
        for (index, batch) in eligible.chunks(batch_size).enumerate() {
            let outcomes = join_all(batch.iter().map(|entry| self.dispatch(entry))).await;

            for outcome in outcomes {
                match outcome? {
                    ItemOutcome::Synced => result.items_synced += 1,
                    ItemOutcome::RetryScheduled => result.retries_scheduled += 1,
                    ItemOutcome::Failed(kind) => {
                        result.items_failed += 1;
                        if kind == FailureKind::Conflict {
                            result.conflicts_found += 1;
                        }
                    }
                }
            }
            current += batch.len();
            result.batches += 1;
            self.emit_progress(&result, current).await;

            if index + 1 < batch_count {
                sleep(network.sync_interval).await;
            }
        }

        result.duration = started.elapsed();
        info!(
            synced = result.items_synced,
            failed = result.items_failed,
            retrying = result.retries_scheduled,
            "Sync completed in {:?}",
            result.duration
        );
        self.emit_completed(&result).await;
        Ok(result)
    }

    async fn dispatch(&self, entry: &OutboxEntry) -> Result<ItemOutcome> {
        let sent = match timeout(self.config.request_timeout, self.remote.send(entry)).await {
            Ok(sent) => sent,
            Err(_) => Err(DispatchError::Timeout(self.config.request_timeout)),
        };

        match sent {
            Ok(_) => {
                let projection = self.store.mark_synced(entry.id, self.clock.now()).await?;
                if let Projection::Failed(reason) = &projection {
                    warn!(entry = entry.id, %reason, "Record projection failed");
                }
                debug!(entry = entry.id, endpoint = %entry.endpoint, "Item synced");
                self.emit(SyncEvent::ItemSynced {
                    entry_id: entry.id,
                    endpoint: entry.endpoint.clone(),
                    projection,
                })
                .await;
                Ok(ItemOutcome::Synced)
            }
            Err(err) => self.handle_failure(entry, err).await,
        }
    }

    async fn handle_failure(&self, entry: &OutboxEntry, err: DispatchError) -> Result<ItemOutcome> {
        let kind = err.kind();
        let message = err.to_string();

        match self.policy.decide(entry.retry_count, err.is_retryable()) {
            RetryDecision::Retry { retry_count, delay } => {
                let now = self.clock.now();
                let next_retry_at = now
                    .checked_add_signed(
                        chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX),
                    )
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.store
                    .mark_retry(entry.id, retry_count, next_retry_at, &message)
                    .await?;

                warn!(
                    entry = entry.id,
                    retry_count,
                    error = %message,
                    "Dispatch failed, retrying in {:?}",
                    delay
                );
                self.emit(SyncEvent::ItemRetryScheduled {
                    entry_id: entry.id,
                    endpoint: entry.endpoint.clone(),
                    retry_count,
                    delay: delay.as_millis() as u64,
                    next_retry_at,
                    error: message,
                })
                .await;
                Ok(ItemOutcome::RetryScheduled)
            }
            RetryDecision::Fail { retry_count } => {
                self.store.mark_failed(entry.id, retry_count, &message).await?;

                warn!(
                    entry = entry.id,
                    retry_count,
                    ?kind,
                    error = %message,
                    "Dispatch failed permanently"
                );
                self.emit(SyncEvent::ItemFailed {
                    entry_id: entry.id,
                    endpoint: entry.endpoint.clone(),
                    retry_count,
                    error: message,
                    kind,
                    conflict: err.conflict().cloned(),
                })
                .await;
                Ok(ItemOutcome::Failed(kind))
            }
        }
    }

    async fn emit_progress(&self, result: &SyncResult, current: usize) {
        self.emit(SyncEvent::SyncProgress {
            total: result.items_count,
            current,
            success_count: result.items_synced,
            fail_count: result.fail_count(),
        })
        .await;
    }

    async fn emit_completed(&self, result: &SyncResult) {
        self.emit(SyncEvent::SyncCompleted {
            items_count: result.items_count,
            success_count: result.items_synced,
            fail_count: result.fail_count(),
        })
        .await;
    }

    /// Publish an event together with fresh outbox counts.
    async fn emit(&self, event: SyncEvent) {
        let stats = match self.store.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Could not read outbox stats");
                None
            }
        };
        self.events.publish(SyncUpdate {
            event,
            stats,
            at: self.clock.now(),
        });
    }
}
