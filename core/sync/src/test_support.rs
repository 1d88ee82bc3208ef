//! Shared fixtures for the crate's unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use edgeclass_common::{DeviceId, Error, ManualClock, RecordKind, RecordRef, Result};
use edgeclass_storage::{
    LocalStore, MemoryStore, NewOutboxEntry, OutboxEntry, OutboxStats, Projection, StoredRecord,
    SyncMethod, WriteBatch,
};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::event::SyncEvent;
use crate::network::NetworkOracle;
use crate::transport::MockRemote;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn quiz_entry(id: &str, at: DateTime<Utc>) -> NewOutboxEntry {
    NewOutboxEntry::new(
        "/sync/quizzes",
        SyncMethod::Create,
        &serde_json::json!({ "id": id, "title": "Fractions" }),
        DeviceId::new("device-a").unwrap(),
        at,
    )
    .unwrap()
    .for_record(RecordRef::new(RecordKind::Quiz, id))
}

/// Engine wired to an in-memory store, a scripted remote and a manual clock.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub remote: Arc<MockRemote>,
    pub oracle: Arc<NetworkOracle>,
    pub clock: Arc<ManualClock>,
    pub engine: Arc<SyncEngine<MemoryStore, MockRemote>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_remote(MockRemote::new(), SyncConfig::default())
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self::with_remote(MockRemote::new().with_latency(latency), SyncConfig::default())
    }

    pub fn with_remote(remote: MockRemote, config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(remote);
        let oracle = Arc::new(NetworkOracle::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote.clone(),
            oracle.clone(),
            clock.clone(),
            config,
        ));
        Self {
            store,
            remote,
            oracle,
            clock,
            engine,
        }
    }

    /// Write a quiz record and its outbox entry; returns the entry id.
    pub async fn enqueue_quiz(&self, id: &str) -> u64 {
        let now = edgeclass_common::Clock::now(self.clock.as_ref());
        let batch = WriteBatch::new(now)
            .upsert(
                RecordRef::new(RecordKind::Quiz, id),
                serde_json::json!({ "id": id }),
            )
            .enqueue(quiz_entry(id, now));
        self.store.write_through(batch).await.unwrap()[0]
    }
}

/// Drain every update currently buffered in `rx`.
pub fn collect_events(rx: &mut broadcast::Receiver<crate::event::SyncUpdate>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(update) = rx.try_recv() {
        events.push(update.event);
    }
    events
}

/// Store whose every operation fails, as if the database were gone.
pub struct BrokenStore;

fn broken<T>() -> Result<T> {
    Err(Error::Storage("database is locked".to_string()))
}

#[async_trait]
impl LocalStore for BrokenStore {
    fn name(&self) -> &str {
        "broken"
    }

    async fn write_through(&self, _: WriteBatch) -> Result<Vec<u64>> {
        broken()
    }

    async fn enqueue(&self, _: NewOutboxEntry) -> Result<u64> {
        broken()
    }

    async fn list_eligible(&self, _: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        broken()
    }

    async fn has_due_retries(&self, _: DateTime<Utc>) -> Result<bool> {
        broken()
    }

    async fn get_entry(&self, _: u64) -> Result<Option<OutboxEntry>> {
        broken()
    }

    async fn list_entries(&self) -> Result<Vec<OutboxEntry>> {
        broken()
    }

    async fn mark_synced(&self, _: u64, _: DateTime<Utc>) -> Result<Projection> {
        broken()
    }

    async fn mark_retry(&self, _: u64, _: u32, _: DateTime<Utc>, _: &str) -> Result<()> {
        broken()
    }

    async fn mark_failed(&self, _: u64, _: u32, _: &str) -> Result<()> {
        broken()
    }

    async fn reset_failed(&self) -> Result<usize> {
        broken()
    }

    async fn stats(&self) -> Result<OutboxStats> {
        broken()
    }

    async fn purge_synced_older_than(&self, _: DateTime<Utc>) -> Result<usize> {
        broken()
    }

    async fn get_record(&self, _: &RecordRef) -> Result<Option<StoredRecord>> {
        broken()
    }
}
