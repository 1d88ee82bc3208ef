//! Offline-first domain writes.
//!
//! Every user-facing mutation is applied to the local store and queued in the
//! outbox in one atomic step, so the UI never waits on the network.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use edgeclass_common::{
    score_answers, Attempt, Clock, DeviceId, Error, Question, QuestionsBatch, Quiz, RecordKind,
    RecordRef, Result, User,
};

use crate::outbox::{NewOutboxEntry, SyncMethod};
use crate::provider::LocalStore;
use crate::record::WriteBatch;

/// Remote endpoint for a record kind.
pub fn endpoint_for(kind: RecordKind) -> String {
    format!("/sync/{}", kind.resource())
}

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// A question as authored, before ids and ordering are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionDraft {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: u32,
}

/// A quiz as authored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuizDraft {
    pub title: String,
    pub description: String,
    pub questions: Vec<QuestionDraft>,
}

/// Applies domain mutations locally and queues them for sync.
pub struct RecordWriter<S: LocalStore + ?Sized> {
    store: Arc<S>,
    device: DeviceId,
    clock: Arc<dyn Clock>,
}

impl<S: LocalStore + ?Sized> RecordWriter<S> {
    pub fn new(store: Arc<S>, device: DeviceId, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            device,
            clock,
        }
    }

    fn entry<T: serde::Serialize>(
        &self,
        endpoint: impl Into<String>,
        method: SyncMethod,
        payload: &T,
        record: RecordRef,
    ) -> Result<NewOutboxEntry> {
        Ok(
            NewOutboxEntry::new(endpoint, method, payload, self.device.clone(), self.clock.now())?
                .for_record(record),
        )
    }

    /// Register a user on this device.
    pub async fn register_user(&self, username: &str) -> Result<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::InvalidInput("Username cannot be empty".to_string()));
        }

        let now = self.clock.now();
        let user = User {
            id: new_id("user"),
            username: username.to_string(),
            device_id: self.device.to_string(),
            created_at: now,
        };
        let record = RecordRef::new(RecordKind::User, &user.id);

        let batch = WriteBatch::new(now)
            .upsert(record.clone(), serde_json::to_value(&user)?)
            .enqueue(self.entry(
                endpoint_for(RecordKind::User),
                SyncMethod::Create,
                &user,
                record,
            )?);
        self.store.write_through(batch).await?;

        info!(user = %user.id, "User registered");
        Ok(user)
    }

    /// Create a quiz and its questions.
    ///
    /// Queues the quiz first and the question batch second, so the server
    /// sees the quiz before its questions.
    pub async fn create_quiz(&self, created_by: &str, draft: QuizDraft) -> Result<Quiz> {
        let now = self.clock.now();
        let quiz = Quiz {
            id: new_id("quiz"),
            title: draft.title,
            description: draft.description,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            device_id: self.device.to_string(),
        };
        let quiz_record = RecordRef::new(RecordKind::Quiz, &quiz.id);

        let mut batch = WriteBatch::new(now)
            .upsert(quiz_record.clone(), serde_json::to_value(&quiz)?)
            .enqueue(self.entry(
                endpoint_for(RecordKind::Quiz),
                SyncMethod::Create,
                &quiz,
                quiz_record,
            )?);

        if !draft.questions.is_empty() {
            let questions: Vec<Question> = draft
                .questions
                .into_iter()
                .enumerate()
                .map(|(order, q)| Question {
                    id: new_id("question"),
                    quiz_id: quiz.id.clone(),
                    question: q.question,
                    options: q.options,
                    correct_answer: q.correct_answer,
                    order: order as u32,
                })
                .collect();
            let questions_record = RecordRef::new(RecordKind::QuestionSet, &quiz.id);
            let payload = QuestionsBatch {
                questions,
                device_id: self.device.to_string(),
            };

            batch = batch
                .upsert(
                    questions_record.clone(),
                    serde_json::to_value(&payload.questions)?,
                )
                .enqueue(self.entry(
                    endpoint_for(RecordKind::QuestionSet),
                    SyncMethod::Create,
                    &payload,
                    questions_record,
                )?);
        }

        self.store.write_through(batch).await?;
        info!(quiz = %quiz.id, "Quiz created");
        Ok(quiz)
    }

    /// Load a quiz from the local store.
    pub async fn get_quiz(&self, id: &str) -> Result<Option<Quiz>> {
        match self
            .store
            .get_record(&RecordRef::new(RecordKind::Quiz, id))
            .await?
        {
            Some(stored) => Ok(Some(serde_json::from_value(stored.body)?)),
            None => Ok(None),
        }
    }

    /// Load a quiz's questions, in order.
    pub async fn get_questions(&self, quiz_id: &str) -> Result<Vec<Question>> {
        match self
            .store
            .get_record(&RecordRef::new(RecordKind::QuestionSet, quiz_id))
            .await?
        {
            Some(stored) => {
                let mut questions: Vec<Question> = serde_json::from_value(stored.body)?;
                questions.sort_by_key(|q| q.order);
                Ok(questions)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Edit a quiz's title and/or description, bumping `updated_at`.
    ///
    /// # Errors
    /// - `NotFound` if the quiz is not stored locally
    pub async fn update_quiz(
        &self,
        id: &str,
        title: Option<String>,
        description: Option<String>,
    ) -> Result<Quiz> {
        let mut quiz = self
            .get_quiz(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Quiz {}", id)))?;

        if let Some(title) = title {
            quiz.title = title;
        }
        if let Some(description) = description {
            quiz.description = description;
        }
        let now = self.clock.now();
        quiz.updated_at = now;
        quiz.device_id = self.device.to_string();

        let record = RecordRef::new(RecordKind::Quiz, &quiz.id);
        let batch = WriteBatch::new(now)
            .upsert(record.clone(), serde_json::to_value(&quiz)?)
            .enqueue(self.entry(
                endpoint_for(RecordKind::Quiz),
                SyncMethod::Update,
                &quiz,
                record,
            )?);
        self.store.write_through(batch).await?;

        info!(quiz = %quiz.id, "Quiz updated");
        Ok(quiz)
    }

    /// Delete a quiz and its questions locally and queue the remote delete.
    pub async fn delete_quiz(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        let record = RecordRef::new(RecordKind::Quiz, id);
        let batch = WriteBatch::new(now)
            .delete(record.clone())
            .delete(RecordRef::new(RecordKind::QuestionSet, id))
            .enqueue(self.entry(
                format!("{}/{}", endpoint_for(RecordKind::Quiz), id),
                SyncMethod::Delete,
                &serde_json::json!({ "id": id }),
                record,
            )?);
        self.store.write_through(batch).await?;

        info!(quiz = %id, "Quiz deleted");
        Ok(())
    }

    /// Record a quiz attempt.
    ///
    /// The score is computed against the locally stored questions and is
    /// provisional; the server recomputes it on receipt.
    ///
    /// # Errors
    /// - `NotFound` if the quiz is not stored locally
    /// - `InvalidInput` if the quiz has no questions
    pub async fn submit_attempt(
        &self,
        quiz_id: &str,
        user_id: &str,
        answers: Vec<u32>,
    ) -> Result<Attempt> {
        if self.get_quiz(quiz_id).await?.is_none() {
            return Err(Error::NotFound(format!("Quiz {}", quiz_id)));
        }
        let questions = self.get_questions(quiz_id).await?;
        if questions.is_empty() {
            return Err(Error::InvalidInput(format!("Quiz {} has no questions", quiz_id)));
        }
        let now = self.clock.now();
        let attempt = Attempt {
            id: new_id("attempt"),
            quiz_id: quiz_id.to_string(),
            user_id: user_id.to_string(),
            score: score_answers(&questions, &answers),
            total_questions: questions.len() as u32,
            answers,
            completed_at: now,
            device_id: self.device.to_string(),
        };
        let record = RecordRef::new(RecordKind::Attempt, &attempt.id);

        let batch = WriteBatch::new(now)
            .upsert(record.clone(), serde_json::to_value(&attempt)?)
            .enqueue(self.entry(
                endpoint_for(RecordKind::Attempt),
                SyncMethod::Create,
                &attempt,
                record,
            )?);
        self.store.write_through(batch).await?;

        info!(attempt = %attempt.id, score = attempt.score, "Attempt submitted");
        Ok(attempt)
    }
}
