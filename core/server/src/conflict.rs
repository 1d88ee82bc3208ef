//! Last-writer-wins conflict detection for quiz writes.

use chrono::{DateTime, Utc};
use tracing::warn;

/// Outcome of comparing an incoming write with the stored version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Store the incoming version.
    Accept,
    /// Keep the stored version; the client is told both timestamps.
    Reject {
        server_updated_at: DateTime<Utc>,
        client_updated_at: DateTime<Utc>,
    },
}

impl Resolution {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Resolution::Accept)
    }
}

/// Compares modification timestamps of a stored and an incoming record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Decide whether an incoming write replaces the stored one.
    ///
    /// Only a stored version strictly newer than the incoming one wins;
    /// equal timestamps are accepted so a retried write stays idempotent.
    pub fn resolve(
        &self,
        record_id: &str,
        stored: Option<DateTime<Utc>>,
        incoming: DateTime<Utc>,
    ) -> Resolution {
        match stored {
            Some(server_updated_at) if server_updated_at > incoming => {
                warn!(
                    record = record_id,
                    %server_updated_at,
                    client_updated_at = %incoming,
                    "Rejecting stale write"
                );
                Resolution::Reject {
                    server_updated_at,
                    client_updated_at: incoming,
                }
            }
            _ => Resolution::Accept,
        }
    }
}
