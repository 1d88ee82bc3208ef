//! HTTP handlers for the sync endpoints.

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use edgeclass_common::{Attempt, QuestionsBatch, Quiz, User};

use crate::conflict::Resolution;
use crate::db::ServerDb;
use crate::error::ApiError;
use crate::validation::parse_body;

/// Header carrying the id of the sending device.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Size of the `/probe` body used for throughput measurement.
pub const PROBE_BYTES: usize = 16 * 1024;

pub type AppState = Arc<ServerDb>;

type ApiResult = Result<Json<Value>, ApiError>;

pub async fn log_request(request: Request, next: Next) -> Response {
    debug!("{} {}", request.method(), request.uri().path());
    next.run(request).await
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "service": "EdgeClass Sync Server",
    }))
}

/// `GET /probe` - fixed-size body for connection quality probes.
pub async fn probe() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        vec![b'.'; PROBE_BYTES],
    )
}

/// `POST /sync/users`
pub async fn sync_user(State(db): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let user: User = parse_body(body)?;
    db.upsert_user(&user).await?;
    Ok(Json(json!({
        "success": true,
        "id": user.id,
        "message": "User synced successfully",
    })))
}

/// `POST /sync/quizzes`
pub async fn sync_quiz(State(db): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let quiz: Quiz = parse_body(body)?;
    match db.upsert_quiz(&quiz).await? {
        Resolution::Accept => Ok(Json(json!({
            "success": true,
            "id": quiz.id,
            "message": "Quiz synced successfully",
        }))),
        Resolution::Reject {
            server_updated_at,
            client_updated_at,
        } => Err(ApiError::Conflict {
            server_updated_at,
            client_updated_at,
        }),
    }
}

/// `POST /sync/questions`
pub async fn sync_questions(State(db): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let batch: QuestionsBatch = parse_body(body)?;
    let count = db.upsert_questions(&batch).await?;
    Ok(Json(json!({
        "success": true,
        "count": count,
        "message": "Questions synced successfully",
    })))
}

/// `POST /sync/attempts`
pub async fn sync_attempt(State(db): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let attempt: Attempt = parse_body(body)?;
    let stored = db.upsert_attempt(&attempt).await?;
    Ok(Json(json!({
        "success": true,
        "id": attempt.id,
        "score": stored.score,
        "totalQuestions": stored.total_questions,
        "message": "Attempt synced successfully",
    })))
}

/// `DELETE /sync/quizzes/{id}`
pub async fn delete_quiz(
    State(db): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let device_id = headers
        .get(DEVICE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let deleted = db.delete_quiz(&id, device_id).await?;
    Ok(Json(json!({
        "success": true,
        "deletedCount": deleted,
        "message": "Quiz deleted successfully",
    })))
}

/// `GET /sync/quizzes`
pub async fn list_quizzes(State(db): State<AppState>) -> ApiResult {
    let quizzes = db.list_quizzes().await?;
    Ok(Json(json!({ "success": true, "quizzes": quizzes })))
}

/// `GET /sync/attempts`
pub async fn list_attempts(State(db): State<AppState>) -> ApiResult {
    let attempts = db.list_attempts().await?;
    Ok(Json(json!({ "success": true, "attempts": attempts })))
}

/// `GET /stats`
pub async fn stats(State(db): State<AppState>) -> ApiResult {
    let stats = db.stats().await?;
    Ok(Json(json!({
        "success": true,
        "stats": stats,
        "timestamp": Utc::now(),
    })))
}

/// `GET /stats/device/{device_id}`
pub async fn device_stats(
    State(db): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult {
    let stats = db.device_stats(&device_id).await?;
    Ok(Json(json!({
        "success": true,
        "deviceId": device_id,
        "stats": stats,
        "timestamp": Utc::now(),
    })))
}
