// Router construction

use std::time::Duration;

use axum::routing::{Router, get};
use http::{Method, header};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{
    SharedState, get_churn_chart_data, get_churn_cohorts, get_churn_metrics, get_churn_summary,
    health_check,
};

/// Builds the API router with CORS and request tracing
pub fn router(state: SharedState) -> Router {
    // Configure CORS policy
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN])
        .expose_headers([header::CONTENT_TYPE, header::CONTENT_LENGTH])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/kpi/churn/summary", get(get_churn_summary))
        .route("/api/kpi/churn/metrics", get(get_churn_metrics))
        .route("/api/kpi/churn/cohorts", get(get_churn_cohorts))
        .route("/api/kpi/churn/chart-data", get(get_churn_chart_data))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use kpi_database::testing::{MockDriver, fast_retry, test_config};
    use kpi_database::{
        ConnectionPoolManager, Database, DatabaseConfig, DriverError, PoolRegistry,
    };

    use super::*;
    use crate::cache::ResponseCache;
    use crate::handlers::AppState;
    use crate::services::churn::queries;

    fn state_with(config: DatabaseConfig, driver: &MockDriver) -> SharedState {
        let manager = ConnectionPoolManager::with_registry(
            config,
            Arc::new(driver.clone()),
            PoolRegistry::new(),
        )
        .with_retry_policy(fast_retry());
        Arc::new(AppState {
            db: Database::from_manager(manager),
            cache: ResponseCache::new(Duration::from_secs(60)),
        })
    }

    async fn get_json(state: &SharedState, uri: &str) -> (StatusCode, Value) {
        let response = router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn active_model() -> Value {
        json!({
            "model_id": "churn-xgb-7",
            "model_name": "churn_classifier",
            "model_version": "v7",
            "model_type": "xgboost",
            "auc_score": 0.91,
            "accuracy": 0.88,
            "precision_score": 0.8,
            "recall_score": 0.75,
            "f1_score": 0.77,
            "optimal_threshold": 0.42,
            "training_date": "2025-01-15T08:00:00+00:00",
            "train_samples": 8000,
            "test_samples": 2000,
            "feature_count": 24,
            "status": "ACTIVE"
        })
    }

    #[tokio::test]
    async fn test_health_reports_connected_database() {
        let driver = MockDriver::new();
        let state = state_with(test_config(), &driver);

        let (status, body) = get_json(&state, "/api/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["services"]["database"], "connected");
        assert_eq!(body["environment"]["hasConnectionString"], true);
        assert_eq!(body["environment"]["hasPassword"], true);
        assert_eq!(body["environment"]["hasCredentialBundle"], false);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_health_is_degraded_without_credentials() {
        let driver = MockDriver::new();
        let mut config = test_config();
        config.password = None;
        let state = state_with(config, &driver);

        let (status, body) = get_json(&state, "/api/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["services"]["database"], "disconnected");
        assert_eq!(body["environment"]["hasPassword"], false);
        assert_eq!(driver.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_churn_summary_combines_queries() {
        let driver = MockDriver::new();
        driver.respond(
            queries::SUMMARY,
            vec![json!({
                "total_customers": 200,
                "at_risk_count": 30,
                "average_risk_score": 22.456,
                "at_risk_percentage": 15.0
            })],
        );
        driver.respond(queries::LTV_AT_RISK, vec![json!({"total_ltv_at_risk": 12345.678})]);
        driver.respond(queries::ACTIVE_MODEL, vec![active_model()]);
        let state = state_with(test_config(), &driver);

        let (status, body) = get_json(&state, "/api/kpi/churn/summary").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["atRiskCount"], 30);
        assert_eq!(body["totalCustomers"], 200);
        assert_eq!(body["averageRiskScore"], 22.46);
        assert_eq!(body["totalLTVAtRisk"], 12345.68);
        assert_eq!(body["modelConfidence"], 0.91);
        assert_eq!(body["modelVersion"], "v7");
        assert_eq!(driver.acquired(), driver.released());
    }

    #[tokio::test]
    async fn test_churn_metrics_without_active_model_is_404() {
        let driver = MockDriver::new();
        let state = state_with(test_config(), &driver);

        let (status, body) = get_json(&state, "/api/kpi/churn/metrics").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Active model not found");
        assert_eq!(body["fallback"], false);
    }

    #[tokio::test]
    async fn test_churn_metrics_shape() {
        let driver = MockDriver::new();
        driver.respond(queries::ACTIVE_MODEL, vec![active_model()]);
        let state = state_with(test_config(), &driver);

        let (status, body) = get_json(&state, "/api/kpi/churn/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["modelId"], "churn-xgb-7");
        assert_eq!(body["f1Score"], 0.77);
        assert_eq!(body["trainingStats"]["featureCount"], 24);
        assert_eq!(body["status"], "ACTIVE");
    }

    #[tokio::test]
    async fn test_churn_cohorts_are_cached() {
        let driver = MockDriver::new();
        driver.respond(
            queries::COHORTS,
            vec![
                json!({"cohort": "VIP", "customer_count": 40, "at_risk_count": 10,
                       "avg_risk_score": 31.5, "avg_risk_score_at_risk": 72.25, "ltv_at_risk": 61000.456}),
                json!({"cohort": "New", "customer_count": 0, "at_risk_count": 0,
                       "avg_risk_score": null, "avg_risk_score_at_risk": null, "ltv_at_risk": 0}),
            ],
        );
        let state = state_with(test_config(), &driver);

        let (status, first) = get_json(&state, "/api/kpi/churn/cohorts").await;
        let (_, second) = get_json(&state, "/api/kpi/churn/cohorts").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, second);
        let cohorts = first["cohorts"].as_array().unwrap();
        assert_eq!(cohorts.len(), 2);
        assert_eq!(cohorts[0]["atRiskPercentage"], 25.0);
        assert_eq!(cohorts[0]["ltvAtRisk"], 61000.46);
        assert_eq!(cohorts[1]["atRiskPercentage"], 0.0);
        assert_eq!(cohorts[1]["averageRiskScoreAtRisk"], 0.0);

        let runs = driver
            .executed()
            .iter()
            .filter(|(sql, _)| sql == queries::COHORTS)
            .count();
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_chart_data_distribution_by_default() {
        let driver = MockDriver::new();
        driver.respond(
            queries::RISK_DISTRIBUTION,
            vec![
                json!({"risk_range": "< 10%", "customer_count": 120, "at_risk_count": 0}),
                json!({"risk_range": ">= 90%", "customer_count": 8, "at_risk_count": 8}),
            ],
        );
        let state = state_with(test_config(), &driver);

        let (status, body) = get_json(&state, "/api/kpi/churn/chart-data").await;
        let (_, explicit) = get_json(&state, "/api/kpi/churn/chart-data?type=distribution").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, explicit);
        assert_eq!(body["chartType"], "distribution");
        assert!(body.get("message").is_none());
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["riskRange"], "< 10%");
        assert_eq!(data[1]["atRiskCount"], 8);
    }

    #[tokio::test]
    async fn test_chart_data_cohort_trend_is_empty() {
        let driver = MockDriver::new();
        let state = state_with(test_config(), &driver);

        let (status, body) = get_json(&state, "/api/kpi/churn/chart-data?type=cohort-trend").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chartType"], "cohort-trend");
        assert_eq!(body["data"], json!([]));
        assert!(body["message"].is_string());
        assert!(driver.executed().is_empty());
    }

    #[tokio::test]
    async fn test_chart_data_rejects_unknown_type() {
        let driver = MockDriver::new();
        let state = state_with(test_config(), &driver);

        let (status, body) = get_json(&state, "/api/kpi/churn/chart-data?type=heatmap").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Validation failed");
        let errors = body["details"]["errors"].as_array().unwrap();
        assert!(errors[0].as_str().unwrap().contains("heatmap"));
        assert_eq!(driver.create_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_database_returns_fallback() {
        let driver = MockDriver::new();
        driver.fail_validations(3, DriverError::broken_session("connection reset by peer"));
        driver.fail_direct(DriverError::broken_session("connection refused"));
        let state = state_with(test_config(), &driver);

        let (status, body) = get_json(&state, "/api/kpi/churn/summary").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["fallback"], true);
        assert_eq!(body["error"], "Connection failed");
        assert!(state.cache.get("churn:summary").is_none());
    }
}
