//! HTTP-level tests against a server on an ephemeral port.

use std::sync::Arc;

use edgeclass_server::{spawn, ServerDb};
use reqwest::StatusCode;
use serde_json::{json, Value};

async fn start() -> (String, Arc<ServerDb>) {
    let db = Arc::new(ServerDb::in_memory().unwrap());
    let (addr, _task) = spawn("127.0.0.1:0", db.clone()).await.unwrap();
    (format!("http://{}", addr), db)
}

fn quiz(updated_at: &str, title: &str) -> Value {
    json!({
        "id": "quiz_1",
        "title": title,
        "description": "Halves and quarters",
        "createdBy": "user_1",
        "createdAt": "2024-03-01T09:00:00Z",
        "updatedAt": updated_at,
        "deviceId": "device-a"
    })
}

fn questions() -> Value {
    json!({
        "questions": [
            {
                "id": "question_1",
                "quizId": "quiz_1",
                "question": "What is half of 8?",
                "options": ["2", "4", "6"],
                "correctAnswer": 1,
                "order": 0
            },
            {
                "id": "question_2",
                "quizId": "quiz_1",
                "question": "What is a quarter of 8?",
                "options": ["2", "4", "6"],
                "correctAnswer": 0,
                "order": 1
            }
        ],
        "deviceId": "device-a"
    })
}

#[tokio::test]
async fn test_health_and_probe() {
    let (base, _db) = start().await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let probe = client.get(format!("{}/probe", base)).send().await.unwrap();
    assert_eq!(probe.status(), StatusCode::OK);
    assert_eq!(
        probe.bytes().await.unwrap().len(),
        edgeclass_server::routes::PROBE_BYTES
    );
}

#[tokio::test]
async fn test_quiz_round_trip_and_conflict() {
    let (base, _db) = start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/sync/quizzes", base))
        .json(&quiz("2024-03-01T10:00:00Z", "Fractions"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Same write again is accepted.
    let response = client
        .post(format!("{}/sync/quizzes", base))
        .json(&quiz("2024-03-01T10:00:00Z", "Fractions"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .post(format!("{}/sync/quizzes", base))
        .json(&quiz("2024-03-01T09:30:00Z", "Stale title"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Conflict");
    assert!(body["serverUpdatedAt"].as_str().unwrap().starts_with("2024-03-01T10:00:00"));
    assert!(body["clientUpdatedAt"].as_str().unwrap().starts_with("2024-03-01T09:30:00"));

    let listed: Value = client
        .get(format!("{}/sync/quizzes", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["quizzes"].as_array().unwrap().len(), 1);
    assert_eq!(listed["quizzes"][0]["title"], "Fractions");
}

#[tokio::test]
async fn test_validation_details() {
    let (base, _db) = start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/sync/users", base))
        .json(&json!({
            "id": "user_1",
            "username": "a",
            "deviceId": "device-a",
            "createdAt": "2024-03-01T09:00:00Z"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Validation failed");
    assert_eq!(body["details"][0]["field"], "username");
}

#[tokio::test]
async fn test_attempt_score_is_recomputed() {
    let (base, _db) = start().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/sync/questions", base))
        .json(&questions())
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let body: Value = client
        .post(format!("{}/sync/attempts", base))
        .json(&json!({
            "id": "attempt_1",
            "quizId": "quiz_1",
            "userId": "user_1",
            "answers": [1, 2],
            "score": 2,
            "totalQuestions": 2,
            "completedAt": "2024-03-01T11:00:00Z",
            "deviceId": "device-a"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["score"], 1);

    let listed: Value = client
        .get(format!("{}/sync/attempts", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["attempts"][0]["score"], 1);
}

#[tokio::test]
async fn test_delete_quiz() {
    let (base, db) = start().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/sync/quizzes", base))
        .json(&quiz("2024-03-01T10:00:00Z", "Fractions"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let body: Value = client
        .delete(format!("{}/sync/quizzes/quiz_1", base))
        .header("x-device-id", "device-a")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["deletedCount"], 1);
    assert!(db.get_quiz("quiz_1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stats_report_totals_and_device_history() {
    let (base, _db) = start().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/sync/quizzes", base))
        .json(&quiz("2024-03-01T10:00:00Z", "Fractions"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    client
        .post(format!("{}/sync/questions", base))
        .json(&questions())
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let body: Value = client
        .get(format!("{}/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["stats"]["quizzes"], 1);
    assert_eq!(body["stats"]["syncLogs"], 3);
    assert_eq!(body["stats"]["recentSyncs"][0]["recordType"], "question");

    let body: Value = client
        .get(format!("{}/stats/device/device-a", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["deviceId"], "device-a");
    assert_eq!(body["stats"]["quizzes"], 1);
    assert_eq!(body["stats"]["attempts"], 0);
    assert_eq!(body["stats"]["syncHistory"].as_array().unwrap().len(), 3);
    assert_eq!(body["stats"]["lastSync"]["recordType"], "question");
}
