//! Common utilities and types shared across EdgeClass modules.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the shared error type, record identities, device identifiers, the wire
//! model of synced records and the clock abstraction used for retry scheduling.

pub mod clock;
pub mod error;
pub mod model;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use model::{score_answers, Attempt, Question, QuestionsBatch, Quiz, User};
pub use types::{DeviceId, RecordKind, RecordRef, SyncMarker};
