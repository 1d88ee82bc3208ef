//! API error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::error;

use crate::validation::FieldError;

/// Error returned by a sync endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The body failed validation.
    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    /// A newer version of the record is already stored.
    #[error("Conflict")]
    Conflict {
        server_updated_at: DateTime<Utc>,
        client_updated_at: DateTime<Utc>,
    },

    /// The server database failed.
    #[error("Database error: {0}")]
    Database(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<edgeclass_common::Error> for ApiError {
    fn from(err: edgeclass_common::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Validation(details) => json!({
                "success": false,
                "error": "Validation failed",
                "details": details,
            }),
            ApiError::Conflict {
                server_updated_at,
                client_updated_at,
            } => json!({
                "success": false,
                "error": "Conflict",
                "serverUpdatedAt": server_updated_at,
                "clientUpdatedAt": client_updated_at,
            }),
            ApiError::Database(message) => {
                error!("Request failed: {}", message);
                json!({ "success": false, "error": message })
            }
        };
        (status, Json(body)).into_response()
    }
}
