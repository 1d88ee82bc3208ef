//! Record sync-status projection.
//!
//! After an outbox entry is delivered, the record it belongs to is flipped to
//! `synced` unless a newer mutation of the same record is still undelivered.
//! The projection is best-effort: its outcome never changes the outbox entry.

use serde::{Deserialize, Serialize};

/// Outcome of projecting a delivered entry onto its domain record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Projection {
    /// Record marker set to synced.
    Applied,
    /// A newer mutation of the record is still undelivered; marker stays pending.
    Superseded,
    /// The record no longer exists locally (e.g. deleted in the interim).
    RecordMissing,
    /// The entry carries no record identity.
    Untracked,
    /// The projection write itself failed.
    Failed(String),
}

impl Projection {
    /// Decide the projection outcome from the local view of the record.
    pub fn decide(record_exists: bool, newer_unsynced: bool) -> Self {
        if !record_exists {
            Projection::RecordMissing
        } else if newer_unsynced {
            Projection::Superseded
        } else {
            Projection::Applied
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Projection::Applied)
    }
}
