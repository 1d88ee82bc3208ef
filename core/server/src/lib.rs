//! EdgeClass sync server
//!
//! Reference server the sync engine delivers to. Accepts idempotent
//! per-resource upserts, validates bodies, rejects stale quiz writes and
//! recomputes attempt scores.
//!
//! ## Routes
//!
//! - `POST /sync/users`, `/sync/quizzes`, `/sync/questions`, `/sync/attempts`
//! - `DELETE /sync/quizzes/{id}`
//! - `GET /sync/quizzes`, `/sync/attempts`
//! - `GET /stats`, `/stats/device/{device_id}`
//! - `GET /health`
//! - `GET /probe`

pub mod conflict;
pub mod db;
pub mod error;
pub mod routes;
pub mod validation;

pub use conflict::{ConflictResolver, Resolution};
pub use db::{DeviceStats, ServerDb, ServerStats, StoredAttempt, SyncLog};
pub use error::ApiError;
pub use validation::{parse_body, FieldError, Validate};

use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

/// Build the router over `db`.
pub fn router(db: Arc<ServerDb>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/probe", get(routes::probe))
        .route("/sync/users", post(routes::sync_user))
        .route(
            "/sync/quizzes",
            post(routes::sync_quiz).get(routes::list_quizzes),
        )
        .route("/sync/quizzes/{id}", delete(routes::delete_quiz))
        .route("/sync/questions", post(routes::sync_questions))
        .route(
            "/sync/attempts",
            post(routes::sync_attempt).get(routes::list_attempts),
        )
        .route("/stats", get(routes::stats))
        .route("/stats/device/{device_id}", get(routes::device_stats))
        .layer(axum::middleware::from_fn(routes::log_request))
        .with_state(db)
}

/// Serve on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, db: Arc<ServerDb>) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!("Sync server listening on {}", addr);
    axum::serve(listener, router(db)).await
}

/// Bind `addr` and serve in the background.
///
/// Returns the bound address, which differs from `addr` when port 0 is used.
pub async fn spawn(
    addr: &str,
    db: Arc<ServerDb>,
) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let task = tokio::spawn(serve(listener, db));
    Ok((local, task))
}
