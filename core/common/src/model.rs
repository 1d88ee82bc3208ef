//! Domain records exchanged between devices and the sync server.
//!
//! Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A locally registered learner or teacher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
}

/// Quiz header. Questions travel separately as a [`QuestionsBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Used by the server for last-writer-wins conflict detection.
    pub updated_at: DateTime<Utc>,
    pub device_id: String,
}

/// One multiple-choice question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub quiz_id: String,
    pub question: String,
    pub options: Vec<String>,
    /// Index into `options`.
    pub correct_answer: u32,
    pub order: u32,
}

/// The full question list of a quiz, sent as one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionsBatch {
    pub questions: Vec<Question>,
    pub device_id: String,
}

/// A completed quiz attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: String,
    pub quiz_id: String,
    pub user_id: String,
    /// Chosen option index per question, in question order.
    pub answers: Vec<u32>,
    pub score: u32,
    pub total_questions: u32,
    pub completed_at: DateTime<Utc>,
    pub device_id: String,
}

/// Count the answers matching each question's correct option.
///
/// Questions are compared in `order`; missing answers score nothing.
pub fn score_answers(questions: &[Question], answers: &[u32]) -> u32 {
    let mut ordered: Vec<&Question> = questions.iter().collect();
    ordered.sort_by_key(|q| q.order);

    ordered
        .iter()
        .zip(answers)
        .filter(|(q, answer)| q.correct_answer == **answer)
        .count() as u32
}
