//! Outbox entry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use edgeclass_common::{DeviceId, Error, RecordRef, Result};

/// Semantic mutation verb of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMethod {
    Create,
    Update,
    Delete,
}

impl SyncMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::Create => "CREATE",
            SyncMethod::Update => "UPDATE",
            SyncMethod::Delete => "DELETE",
        }
    }
}

impl FromStr for SyncMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(SyncMethod::Create),
            "UPDATE" => Ok(SyncMethod::Update),
            "DELETE" => Ok(SyncMethod::Delete),
            other => Err(Error::InvalidInput(format!("Unknown sync method: {}", other))),
        }
    }
}

/// Delivery status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Eligible now, or waiting for `next_retry_at`.
    Pending,
    /// Delivered. Terminal.
    Synced,
    /// Abandoned after a non-retryable error or the retry ceiling. Terminal
    /// until a manual reset.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Synced => "synced",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "synced" => Ok(OutboxStatus::Synced),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown outbox status: {}", other))),
        }
    }
}

/// A mutation intent waiting for (or done with) delivery to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Store-assigned, strictly increasing.
    pub id: u64,
    /// Remote resource path, e.g. `/sync/quizzes` or `/sync/quizzes/{id}`.
    pub endpoint: String,
    pub method: SyncMethod,
    /// JSON snapshot captured at enqueue time. Never rewritten.
    pub payload: String,
    /// Domain record this mutation belongs to, if any.
    pub record: Option<RecordRef>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: OutboxStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub owner_device: DeviceId,
}

impl OutboxEntry {
    /// Build a fresh pending entry from an enqueue request.
    pub fn from_new(id: u64, new: NewOutboxEntry) -> Self {
        Self {
            id,
            endpoint: new.endpoint,
            method: new.method,
            payload: new.payload,
            record: new.record,
            enqueued_at: new.enqueued_at,
            retry_count: 0,
            status: OutboxStatus::Pending,
            next_retry_at: None,
            last_error: None,
            synced_at: None,
            owner_device: new.owner_device,
        }
    }

    /// Whether the entry may be dispatched at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether a scheduled retry has come due at `now`.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Parse the payload snapshot.
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Request to append a new entry to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEntry {
    pub endpoint: String,
    pub method: SyncMethod,
    pub payload: String,
    pub record: Option<RecordRef>,
    pub owner_device: DeviceId,
    pub enqueued_at: DateTime<Utc>,
}

impl NewOutboxEntry {
    /// Snapshot `payload` as JSON and build an enqueue request.
    pub fn new<T: Serialize>(
        endpoint: impl Into<String>,
        method: SyncMethod,
        payload: &T,
        owner_device: DeviceId,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            method,
            payload: serde_json::to_string(payload)?,
            record: None,
            owner_device,
            enqueued_at,
        })
    }

    /// Attach the domain record identity used by the sync-marker projection.
    pub fn for_record(mut self, record: RecordRef) -> Self {
        self.record = Some(record);
        self
    }
}

/// Aggregate counts of outbox entries by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
    pub total: usize,
}

impl OutboxStats {
    /// Count one entry with the given status.
    pub fn record(&mut self, status: OutboxStatus) {
        match status {
            OutboxStatus::Pending => self.pending += 1,
            OutboxStatus::Synced => self.synced += 1,
            OutboxStatus::Failed => self.failed += 1,
        }
        self.total += 1;
    }
}
