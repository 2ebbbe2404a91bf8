// Health check endpoint handler implementation

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;

use super::SharedState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: String,
    services: ServiceStatus,
    environment: EnvironmentStatus,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    database: &'static str,
}

// Presence flags only; values are never echoed
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    has_connection_string: bool,
    has_username: bool,
    has_password: bool,
    has_credential_bundle: bool,
}

/// Handler for GET /api/health - Probes the database with a trivial query
pub async fn health_check(State(state): State<SharedState>) -> Response {
    let connected = state.db.test_connection().await;
    let config = state.db.config();

    let body = HealthResponse {
        status: if connected { "healthy" } else { "degraded" },
        timestamp: Utc::now().to_rfc3339(),
        services: ServiceStatus {
            database: if connected { "connected" } else { "disconnected" },
        },
        environment: EnvironmentStatus {
            has_connection_string: config.connection_string.is_some(),
            has_username: !config.username.is_empty(),
            has_password: config.password.is_some(),
            has_credential_bundle: config.credential_bundle.is_some(),
        },
    };

    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}
