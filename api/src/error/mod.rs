use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use kpi_database::DbError;

/// Errors surfaced by the dashboard endpoints
///
/// Everything except `NotFound` tells the frontend to switch to its
/// fallback data.
#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("{error}: {message}")]
    Unavailable { error: String, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invalid request: {}", .0.join("; "))]
    InvalidRequest(Vec<String>),
}

pub type DashboardResult<T> = Result<T, DashboardError>;

impl DashboardError {
    pub fn unavailable(error: &str, message: impl Into<String>) -> Self {
        DashboardError::Unavailable {
            error: error.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            DashboardError::Unavailable { error, message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": error, "message": message, "fallback": true }),
            ),
            DashboardError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                json!({
                    "error": "Not found",
                    "message": format!("{} not found", resource),
                    "fallback": false
                }),
            ),
            DashboardError::InvalidRequest(errors) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "Validation failed",
                    "message": "Invalid request parameters",
                    "details": { "errors": errors }
                }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

// DbError to DashboardError conversion implementation
impl From<DbError> for DashboardError {
    fn from(err: DbError) -> Self {
        match &err {
            DbError::Configuration(msg) => {
                DashboardError::unavailable("Configuration error", msg.clone())
            }
            DbError::BrokenSession(_)
            | DbError::AcquireTimeout(_)
            | DbError::ConnectionFailed { .. } => DashboardError::unavailable(
                "Connection failed",
                "Unable to connect to database. Please check connection string.",
            ),
            DbError::Driver(source) => match source.code.as_deref() {
                Some("28P01") | Some("28000") => DashboardError::unavailable(
                    "Authentication failed",
                    "Database authentication failed. Please check credentials.",
                ),
                Some("42P01") => DashboardError::unavailable(
                    "Resource not found",
                    "Required database table or view does not exist.",
                ),
                _ => DashboardError::unavailable("Database error", err.to_string()),
            },
        }
    }
}
