//! Common types used throughout EdgeClass.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of the device that authored a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty after trimming
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "DeviceId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random device identifier.
    pub fn generate() -> Self {
        Self(format!("device_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of domain record that participates in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    User,
    Quiz,
    /// The full question list of one quiz, keyed by the quiz id.
    QuestionSet,
    Attempt,
}

impl RecordKind {
    /// All kinds, in a stable order.
    pub const ALL: [RecordKind; 4] = [
        RecordKind::User,
        RecordKind::Quiz,
        RecordKind::QuestionSet,
        RecordKind::Attempt,
    ];

    /// Stable name used in local storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::User => "user",
            RecordKind::Quiz => "quiz",
            RecordKind::QuestionSet => "question_set",
            RecordKind::Attempt => "attempt",
        }
    }

    /// Remote resource segment (`/sync/<resource>`).
    pub fn resource(&self) -> &'static str {
        match self {
            RecordKind::User => "users",
            RecordKind::Quiz => "quizzes",
            RecordKind::QuestionSet => "questions",
            RecordKind::Attempt => "attempts",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown record kind: {}", s)))
    }
}

/// Identity of a domain record: its kind plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub kind: RecordKind,
    pub id: String,
}

impl RecordRef {
    /// Create a record reference.
    pub fn new(kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Per-record flag distinguishing unconfirmed local state from server-confirmed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMarker {
    Pending,
    Synced,
}

impl SyncMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMarker::Pending => "pending",
            SyncMarker::Synced => "synced",
        }
    }
}

impl FromStr for SyncMarker {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(SyncMarker::Pending),
            "synced" => Ok(SyncMarker::Synced),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown sync marker: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_creation() {
        let id = DeviceId::new("  tablet-1 ").unwrap();
        assert_eq!(id.as_str(), "tablet-1");
    }

    #[test]
    fn test_device_id_empty_fails() {
        assert!(DeviceId::new("   ").is_err());
    }

    #[test]
    fn test_generated_device_ids_differ() {
        let a = DeviceId::generate();
        let b = DeviceId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("device_"));
    }

    #[test]
    fn test_record_kind_round_trip_names() {
        for kind in RecordKind::ALL {
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
        assert!("doubt".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_record_kind_resources() {
        assert_eq!(RecordKind::Quiz.resource(), "quizzes");
        assert_eq!(RecordKind::QuestionSet.resource(), "questions");
    }

    #[test]
    fn test_record_ref_display() {
        let record = RecordRef::new(RecordKind::Attempt, "attempt_1");
        assert_eq!(record.to_string(), "attempt:attempt_1");
    }

    #[test]
    fn test_sync_marker_parse() {
        assert_eq!("synced".parse::<SyncMarker>().unwrap(), SyncMarker::Synced);
        assert!("done".parse::<SyncMarker>().is_err());
    }
}
