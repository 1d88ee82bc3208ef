//! Local persistence for EdgeClass.
//!
//! This crate holds everything a device keeps on disk while offline: the
//! outbox of mutations awaiting delivery, the domain records those mutations
//! describe, and a small settings table. Two backends implement the
//! [`LocalStore`] trait: an in-memory store for tests and a SQLite store.
//!
//! # Design Principles
//! - Write-through: a domain write and its outbox entry commit together
//! - Append-only payloads: entries snapshot their payload at enqueue time
//! - Best-effort projection: delivering an entry flips its record to `synced`
//!   without ever blocking the outbox update

pub mod memory;
pub mod outbox;
pub mod projection;
pub mod provider;
pub mod record;
pub mod sqlite;
pub mod writer;

pub use memory::MemoryStore;
pub use outbox::{NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStatus, SyncMethod};
pub use projection::Projection;
pub use provider::{LocalStore, SettingsStore};
pub use record::{RecordWrite, StoredRecord, WriteBatch};
pub use sqlite::SqliteStore;
pub use writer::{endpoint_for, QuestionDraft, QuizDraft, RecordWriter};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _ = MemoryStore::new();
        let _ = SqliteStore::in_memory().unwrap();
        assert_eq!(OutboxStatus::Failed.as_str(), "failed");
    }
}
