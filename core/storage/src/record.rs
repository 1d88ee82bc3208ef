//! Domain records held in the local store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use edgeclass_common::{RecordRef, SyncMarker};

use crate::outbox::NewOutboxEntry;

/// A domain record as persisted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record: RecordRef,
    pub body: serde_json::Value,
    pub sync_status: SyncMarker,
    pub updated_at: DateTime<Utc>,
}

/// A single domain write.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    /// Insert or replace the record; its marker becomes pending.
    Upsert {
        record: RecordRef,
        body: serde_json::Value,
    },
    /// Remove the record locally.
    Delete { record: RecordRef },
}

impl RecordWrite {
    pub fn record(&self) -> &RecordRef {
        match self {
            RecordWrite::Upsert { record, .. } | RecordWrite::Delete { record } => record,
        }
    }
}

/// Domain writes and the outbox entries describing them, committed together.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    pub writes: Vec<RecordWrite>,
    pub entries: Vec<NewOutboxEntry>,
    /// Timestamp stamped on upserted records.
    pub written_at: DateTime<Utc>,
}

impl WriteBatch {
    pub fn new(written_at: DateTime<Utc>) -> Self {
        Self {
            writes: Vec::new(),
            entries: Vec::new(),
            written_at,
        }
    }

    pub fn upsert(mut self, record: RecordRef, body: serde_json::Value) -> Self {
        self.writes.push(RecordWrite::Upsert { record, body });
        self
    }

    pub fn delete(mut self, record: RecordRef) -> Self {
        self.writes.push(RecordWrite::Delete { record });
        self
    }

    pub fn enqueue(mut self, entry: NewOutboxEntry) -> Self {
        self.entries.push(entry);
        self
    }
}
