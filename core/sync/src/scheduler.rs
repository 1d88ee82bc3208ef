//! Background scheduling of sync cycles.
//!
//! One task owns every automatic trigger:
//! - a short retry sweep that starts a cycle when a backed-off entry is due
//! - an adaptive full sync that also purges old synced entries
//! - a reconnect trigger on every offline to online transition
//! - on-demand requests from the handle

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use edgeclass_common::{Error, Result};
use edgeclass_storage::LocalStore;

use crate::engine::{SyncEngine, SyncOutcome};
use crate::network::NetworkState;
use crate::transport::RemoteApi;

/// Request sent to the scheduler task.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run a cycle now.
    SyncNow,
    /// Stop the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<SyncOutcome>>;

/// Scheduler for sync timing and requests.
pub struct SyncScheduler;

impl SyncScheduler {
    /// Start the scheduler task for `engine`.
    pub fn spawn<S, R>(engine: Arc<SyncEngine<S, R>>) -> SyncSchedulerHandle
    where
        S: LocalStore + ?Sized + 'static,
        R: RemoteApi + ?Sized + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel(16);
        // Subscribe before the task runs so no transition is missed.
        let mut network = engine.oracle().subscribe();
        let was_online = network.borrow_and_update().is_online;
        let task = tokio::spawn(run(engine, request_rx, network, was_online));
        SyncSchedulerHandle { request_tx, task }
    }
}

/// Handle for the scheduler background task.
///
/// Dropping the handle stops the scheduler once its current cycle ends.
pub struct SyncSchedulerHandle {
    request_tx: mpsc::Sender<(SyncRequest, Reply)>,
    task: JoinHandle<()>,
}

impl SyncSchedulerHandle {
    /// Run a cycle now and wait for its outcome.
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::SyncNow, reply_tx))
            .await
            .map_err(|_| Error::Sync("Scheduler not running".to_string()))?;

        reply_rx
            .await
            .map_err(|_| Error::Sync("Failed to receive sync result".to_string()))?
    }

    /// Stop the scheduler and wait for the task to finish.
    pub async fn shutdown(self) {
        let (reply_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, reply_tx))
            .await;
        let _ = self.task.await;
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

fn full_sync_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn run<S, R>(
    engine: Arc<SyncEngine<S, R>>,
    mut request_rx: mpsc::Receiver<(SyncRequest, Reply)>,
    mut network: watch::Receiver<NetworkState>,
    mut was_online: bool,
) where
    S: LocalStore + ?Sized + 'static,
    R: RemoteApi + ?Sized + 'static,
{
    let oracle = engine.oracle().clone();

    let mut sweep = interval(engine.config().retry_sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut full_sync_period = oracle.network_info().full_sync_interval;
    let mut full_sync = full_sync_timer(full_sync_period);

    info!("Sync scheduler started");

    loop {
        tokio::select! {
            request = request_rx.recv() => {
                match request {
                    Some((SyncRequest::SyncNow, reply)) => {
                        debug!("Processing sync request");
                        let _ = reply.send(engine.sync_all().await);
                    }
                    Some((SyncRequest::Shutdown, _)) => {
                        info!("Received shutdown request");
                        break;
                    }
                    None => {
                        debug!("Scheduler handle dropped");
                        break;
                    }
                }
            }

            _ = sweep.tick() => {
                if engine.is_syncing() || !oracle.is_online() {
                    continue;
                }
                match engine.has_due_retries().await {
                    Ok(true) => {
                        debug!("Retries due, triggering sync");
                        log_outcome("Retry sweep", engine.sync_all().await);
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Retry sweep could not read the outbox"),
                }
            }

            _ = full_sync.tick() => {
                debug!("Triggering periodic sync");
                log_outcome("Periodic sync", engine.sync_all().await);
                if let Err(e) = engine.purge_synced().await {
                    warn!(error = %e, "Purge of synced entries failed");
                }
            }

            changed = network.changed() => {
                if changed.is_err() {
                    continue;
                }
                let state = *network.borrow_and_update();

                let period = state.effective().full_sync_interval();
                if period != full_sync_period {
                    debug!(?period, "Full sync interval changed");
                    full_sync_period = period;
                    full_sync = full_sync_timer(period);
                }

                let reconnected = state.is_online && !was_online;
                was_online = state.is_online;
                if reconnected {
                    info!("Connection restored, triggering sync");
                    log_outcome("Reconnect sync", engine.sync_all().await);
                }
            }
        }
    }

    info!("Sync scheduler stopped");
}

fn log_outcome(trigger: &str, outcome: Result<SyncOutcome>) {
    match outcome {
        Ok(SyncOutcome::Completed(result)) => info!(
            "{} completed: {} synced, {} failed, {} retrying",
            trigger, result.items_synced, result.items_failed, result.retries_scheduled
        ),
        Ok(other) => debug!("{} did not run: {:?}", trigger, other),
        Err(e) => error!("{} failed: {}", trigger, e),
    }
}
