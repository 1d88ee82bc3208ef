//! Request body validation.
//!
//! Bodies are taken as raw JSON so shape errors and rule violations are
//! reported the same way: a list of `{field, message}` details.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use edgeclass_common::{Attempt, Question, QuestionsBatch, Quiz, User};

use crate::error::ApiError;

/// Most questions accepted in one batch.
pub const MAX_QUESTIONS: usize = 50;

/// One rule violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Rules a decoded body must satisfy before it is stored.
pub trait Validate {
    /// Every violation found; empty when the body is acceptable.
    fn validate(&self) -> Vec<FieldError>;
}

/// Decode `body` as `T` and check its rules.
///
/// # Errors
/// - `ApiError::Validation` if decoding fails or any rule is violated
pub fn parse_body<T>(body: Value) -> Result<T, ApiError>
where
    T: DeserializeOwned + Validate,
{
    let value: T = serde_json::from_value(body).map_err(|e| {
        let message = e.to_string();
        let field = field_of(&message).to_string();
        ApiError::Validation(vec![FieldError::new(field, message)])
    })?;

    let errors = value.validate();
    if errors.is_empty() {
        Ok(value)
    } else {
        Err(ApiError::Validation(errors))
    }
}

/// Field named in a serde message such as "missing field `title`".
fn field_of(message: &str) -> &str {
    if !message.starts_with("missing field") {
        return "body";
    }
    message
        .split('`')
        .nth(1)
        .filter(|f| !f.is_empty())
        .unwrap_or("body")
}

fn required(errors: &mut Vec<FieldError>, field: &str, value: &str, what: &str) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, format!("{} is required", what)));
    }
}

fn length(errors: &mut Vec<FieldError>, field: &str, value: &str, min: usize, max: usize) {
    let len = value.chars().count();
    if len < min {
        errors.push(FieldError::new(
            field,
            format!("Must be at least {} characters", min),
        ));
    } else if len > max {
        errors.push(FieldError::new(
            field,
            format!("Must be at most {} characters", max),
        ));
    }
}

impl Validate for User {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        required(&mut errors, "id", &self.id, "User ID");
        length(&mut errors, "username", &self.username, 2, 50);
        required(&mut errors, "deviceId", &self.device_id, "Device ID");
        errors
    }
}

impl Validate for Quiz {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        required(&mut errors, "id", &self.id, "Quiz ID");
        length(&mut errors, "title", &self.title, 3, 200);
        length(&mut errors, "description", &self.description, 0, 1000);
        required(&mut errors, "createdBy", &self.created_by, "Creator ID");
        required(&mut errors, "deviceId", &self.device_id, "Device ID");
        errors
    }
}

fn validate_question(errors: &mut Vec<FieldError>, index: usize, question: &Question) {
    let field = |name: &str| format!("questions.{}.{}", index, name);

    if question.id.trim().is_empty() {
        errors.push(FieldError::new(field("id"), "Question ID is required"));
    }
    if question.quiz_id.trim().is_empty() {
        errors.push(FieldError::new(field("quizId"), "Quiz ID is required"));
    }
    length(errors, &field("question"), &question.question, 5, 500);
}

impl Validate for QuestionsBatch {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.questions.is_empty() {
            errors.push(FieldError::new("questions", "At least 1 question is required"));
        } else if self.questions.len() > MAX_QUESTIONS {
            errors.push(FieldError::new(
                "questions",
                format!("At most {} questions are allowed", MAX_QUESTIONS),
            ));
        }
        for (index, question) in self.questions.iter().enumerate() {
            validate_question(&mut errors, index, question);
        }
        required(&mut errors, "deviceId", &self.device_id, "Device ID");
        errors
    }
}

impl Validate for Attempt {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        required(&mut errors, "id", &self.id, "Attempt ID");
        required(&mut errors, "quizId", &self.quiz_id, "Quiz ID");
        required(&mut errors, "userId", &self.user_id, "User ID");
        if self.total_questions < 1 {
            errors.push(FieldError::new("totalQuestions", "Must be at least 1"));
        }
        required(&mut errors, "deviceId", &self.device_id, "Device ID");
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quiz_body() -> Value {
        json!({
            "id": "quiz_1",
            "title": "Fractions",
            "createdBy": "user_1",
            "createdAt": "2024-03-01T09:00:00Z",
            "updatedAt": "2024-03-01T09:00:00Z",
            "deviceId": "device-a"
        })
    }

    fn details(err: ApiError) -> Vec<FieldError> {
        match err {
            ApiError::Validation(details) => details,
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_valid_quiz() {
        let quiz: Quiz = parse_body(quiz_body()).unwrap();
        assert_eq!(quiz.title, "Fractions");
        assert_eq!(quiz.description, "");
    }

    #[test]
    fn test_short_title_rejected() {
        let mut body = quiz_body();
        body["title"] = json!("ab");
        let errors = details(parse_body::<Quiz>(body).unwrap_err());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "title");
    }

    #[test]
    fn test_missing_field_names_the_field() {
        let mut body = quiz_body();
        body.as_object_mut().unwrap().remove("createdBy");
        let errors = details(parse_body::<Quiz>(body).unwrap_err());
        assert_eq!(errors[0].field, "createdBy");
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut body = quiz_body();
        body["updatedAt"] = json!("not a date");
        assert!(parse_body::<Quiz>(body).is_err());
    }

    #[test]
    fn test_username_bounds() {
        let user = |name: &str| {
            json!({
                "id": "user_1",
                "username": name,
                "deviceId": "device-a",
                "createdAt": "2024-03-01T09:00:00Z"
            })
        };
        assert!(parse_body::<User>(user("al")).is_ok());
        assert!(parse_body::<User>(user("a")).is_err());
        assert!(parse_body::<User>(user(&"x".repeat(51))).is_err());
    }

    #[test]
    fn test_questions_batch_rules() {
        let question = |order: u32, text: &str| {
            json!({
                "id": format!("question_{}", order),
                "quizId": "quiz_1",
                "question": text,
                "options": ["3", "4"],
                "correctAnswer": 1,
                "order": order
            })
        };

        let empty = json!({ "questions": [], "deviceId": "device-a" });
        let errors = details(parse_body::<QuestionsBatch>(empty).unwrap_err());
        assert_eq!(errors[0].field, "questions");

        let short = json!({ "questions": [question(0, "2+2")], "deviceId": "device-a" });
        let errors = details(parse_body::<QuestionsBatch>(short).unwrap_err());
        assert_eq!(errors[0].field, "questions.0.question");

        let too_many: Vec<Value> = (0..51).map(|i| question(i, "What is 2 + 2?")).collect();
        let body = json!({ "questions": too_many, "deviceId": "device-a" });
        assert!(parse_body::<QuestionsBatch>(body).is_err());

        let mut negative_order = json!({
            "questions": [question(0, "What is 2 + 2?")],
            "deviceId": "device-a"
        });
        negative_order["questions"][0]["order"] = json!(-1);
        assert!(parse_body::<QuestionsBatch>(negative_order).is_err());
    }

    #[test]
    fn test_attempt_needs_questions() {
        let body = json!({
            "id": "attempt_1",
            "quizId": "quiz_1",
            "userId": "user_1",
            "answers": [1],
            "score": 1,
            "totalQuestions": 0,
            "completedAt": "2024-03-01T09:00:00Z",
            "deviceId": "device-a"
        });
        let errors = details(parse_body::<Attempt>(body).unwrap_err());
        assert_eq!(errors[0].field, "totalQuestions");
    }
}
