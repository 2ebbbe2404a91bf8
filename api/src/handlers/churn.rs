// Churn KPI endpoint handlers

use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::SharedState;
use crate::error::{DashboardError, DashboardResult};
use crate::services::churn::{ChartKind, ChurnService};

const SUMMARY_KEY: &str = "churn:summary";
const METRICS_KEY: &str = "churn:metrics";
const COHORTS_KEY: &str = "churn:cohorts";
const DISTRIBUTION_KEY: &str = "churn:chart-data:distribution";

/// Serves `key` from the cache, or computes, stores and returns it
async fn cached<T, F, Fut>(state: &SharedState, key: &str, compute: F) -> DashboardResult<Json<Value>>
where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = DashboardResult<T>>,
{
    if let Some(value) = state.cache.get(key) {
        debug!(key, "Serving cached response");
        return Ok(Json(value));
    }

    let value = compute().await.map_err(|err| {
        warn!(key, "KPI request failed: {}", err);
        err
    })?;
    let value = serde_json::to_value(value)
        .map_err(|e| DashboardError::unavailable("Service unavailable", e.to_string()))?;
    state.cache.insert(key, value.clone());
    Ok(Json(value))
}

// Handler for GET /api/kpi/churn/summary
pub async fn get_churn_summary(State(state): State<SharedState>) -> DashboardResult<Json<Value>> {
    cached(&state, SUMMARY_KEY, || ChurnService::new(&state.db).summary()).await
}

// Handler for GET /api/kpi/churn/metrics
pub async fn get_churn_metrics(State(state): State<SharedState>) -> DashboardResult<Json<Value>> {
    cached(&state, METRICS_KEY, || ChurnService::new(&state.db).metrics()).await
}

// Handler for GET /api/kpi/churn/cohorts
pub async fn get_churn_cohorts(State(state): State<SharedState>) -> DashboardResult<Json<Value>> {
    cached(&state, COHORTS_KEY, || ChurnService::new(&state.db).cohorts()).await
}

// Query parameters for the chart-data endpoint
#[derive(Debug, Deserialize)]
pub struct ChartDataQuery {
    #[serde(rename = "type")]
    chart_type: Option<String>,
}

// Handler for GET /api/kpi/churn/chart-data?type=distribution|cohort-trend
pub async fn get_churn_chart_data(
    State(state): State<SharedState>,
    Query(params): Query<ChartDataQuery>,
) -> DashboardResult<Json<Value>> {
    let kind = ChartKind::parse(params.chart_type.as_deref())?;
    let service = ChurnService::new(&state.db);
    match kind {
        ChartKind::Distribution => {
            cached(&state, DISTRIBUTION_KEY, || service.chart_data(kind)).await
        }
        // Placeholder data, nothing worth caching
        ChartKind::CohortTrend => {
            let chart = service.chart_data(kind).await?;
            serde_json::to_value(chart)
                .map(Json)
                .map_err(|e| DashboardError::unavailable("Service unavailable", e.to_string()))
        }
    }
}
