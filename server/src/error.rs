//! Handler errors and their HTTP rendering.
//!
//! Anything the client can fix maps to a 4xx; storage trouble maps to a 5xx,
//! which `HttpGateway` treats as retryable.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = match self {
            AppError::Database(ref e) => {
                tracing::error!(error = ?e, "database failure");
                ErrorBody {
                    error: "Database error".into(),
                    details: None,
                }
            }
            AppError::Internal(ref msg) => {
                tracing::error!(%msg, "internal failure");
                ErrorBody {
                    error: "Internal server error".into(),
                    details: Some(msg.clone()),
                }
            }
            AppError::BadRequest(ref msg) | AppError::NotFound(ref msg) => ErrorBody {
                error: msg.clone(),
                details: None,
            },
        };

        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
