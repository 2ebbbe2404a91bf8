//! Churn risk KPIs computed from the model scoring tables

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use kpi_database::{Database, ExecuteOptions, Row};

use crate::error::{DashboardError, DashboardResult};

pub(crate) mod queries {
    pub const SUMMARY: &str = "SELECT COUNT(*) AS total_customers, \
        SUM(CASE WHEN predicted_churn_label = 1 THEN 1 ELSE 0 END) AS at_risk_count, \
        AVG(predicted_churn_probability) * 100 AS average_risk_score, \
        SUM(CASE WHEN predicted_churn_label = 1 THEN 1 ELSE 0 END) * 100.0 / NULLIF(COUNT(*), 0) AS at_risk_percentage \
        FROM oml.churn_predictions";

    pub const LTV_AT_RISK: &str = "SELECT \
        SUM(CASE WHEN cp.predicted_churn_label = 1 THEN up.lifetime_value ELSE 0 END) AS total_ltv_at_risk \
        FROM oml.churn_predictions cp \
        INNER JOIN oml.user_profiles up ON cp.user_id = up.user_id";

    pub const ACTIVE_MODEL: &str = "SELECT model_id, model_name, model_version, model_type, \
        auc_score, accuracy, precision_score, recall_score, f1_score, optimal_threshold, \
        training_date, train_samples, test_samples, feature_count, status \
        FROM oml.model_registry \
        WHERE status = 'ACTIVE' \
        ORDER BY training_date DESC \
        LIMIT 1";

    pub const COHORTS: &str = "WITH cohort_assignments AS ( \
        SELECT cp.predicted_churn_probability, cp.predicted_churn_label, up.lifetime_value, \
        CASE \
            WHEN up.lifetime_value > 5000 OR au.affinity_card = 1 THEN 'VIP' \
            WHEN up.membership_years < 1 THEN 'New' \
            WHEN up.days_since_last_purchase > 90 OR up.login_frequency = 0 THEN 'Dormant' \
            WHEN up.total_purchases >= 2 AND up.days_since_last_purchase <= 90 \
                AND up.login_frequency > 0 THEN 'Regular' \
            ELSE 'Other' \
        END AS cohort \
        FROM oml.churn_predictions cp \
        JOIN oml.user_profiles up ON cp.user_id = up.user_id \
        JOIN admin.users au ON up.user_id = au.id \
        ) \
        SELECT cohort, COUNT(*) AS customer_count, \
        SUM(CASE WHEN predicted_churn_label = 1 THEN 1 ELSE 0 END) AS at_risk_count, \
        ROUND(AVG(predicted_churn_probability)::numeric * 100, 2) AS avg_risk_score, \
        ROUND(AVG(CASE WHEN predicted_churn_label = 1 THEN predicted_churn_probability END)::numeric * 100, 2) AS avg_risk_score_at_risk, \
        SUM(CASE WHEN predicted_churn_label = 1 THEN lifetime_value ELSE 0 END) AS ltv_at_risk \
        FROM cohort_assignments \
        WHERE cohort != 'Other' \
        GROUP BY cohort \
        ORDER BY CASE cohort WHEN 'VIP' THEN 1 WHEN 'Regular' THEN 2 WHEN 'New' THEN 3 WHEN 'Dormant' THEN 4 ELSE 5 END";

    pub const RISK_DISTRIBUTION: &str = "SELECT \
        CASE \
            WHEN predicted_churn_probability < 0.1 THEN '< 10%' \
            WHEN predicted_churn_probability < 0.2 THEN '10-20%' \
            WHEN predicted_churn_probability < 0.3 THEN '20-30%' \
            WHEN predicted_churn_probability < 0.4 THEN '30-40%' \
            WHEN predicted_churn_probability < 0.5 THEN '40-50%' \
            WHEN predicted_churn_probability < 0.6 THEN '50-60%' \
            WHEN predicted_churn_probability < 0.7 THEN '60-70%' \
            WHEN predicted_churn_probability < 0.8 THEN '70-80%' \
            WHEN predicted_churn_probability < 0.9 THEN '80-90%' \
            ELSE '>= 90%' \
        END AS risk_range, \
        COUNT(*) AS customer_count, \
        SUM(CASE WHEN predicted_churn_label = 1 THEN 1 ELSE 0 END) AS at_risk_count \
        FROM oml.churn_predictions \
        GROUP BY risk_range \
        ORDER BY MIN(predicted_churn_probability)";
}

/// Charts served by the chart-data endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    /// Customers bucketed by predicted churn probability
    Distribution,
    /// Historical cohort trends; no history is stored yet
    CohortTrend,
}

impl ChartKind {
    /// Parses the `type` query parameter; absent means `distribution`
    pub fn parse(raw: Option<&str>) -> DashboardResult<Self> {
        match raw {
            None | Some("distribution") => Ok(ChartKind::Distribution),
            Some("cohort-trend") => Ok(ChartKind::CohortTrend),
            Some(other) => Err(DashboardError::InvalidRequest(vec![format!(
                "Chart type '{}' is not supported. Use 'distribution' or 'cohort-trend'.",
                other
            )])),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Distribution => "distribution",
            ChartKind::CohortTrend => "cohort-trend",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskBucket {
    pub risk_range: String,
    pub customer_count: i64,
    pub at_risk_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub chart_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: Vec<RiskBucket>,
}

/// Headline churn numbers for the dashboard card
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChurnSummary {
    pub at_risk_count: i64,
    pub total_customers: i64,
    pub at_risk_percentage: f64,
    pub average_risk_score: f64,
    #[serde(rename = "totalLTVAtRisk")]
    pub total_ltv_at_risk: f64,
    pub model_confidence: Option<f64>,
    pub last_update: Option<String>,
    pub model_version: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingStats {
    pub train_samples: i64,
    pub test_samples: i64,
    pub feature_count: i64,
}

/// Registry entry of the active churn model
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetrics {
    pub model_id: Option<String>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
    pub model_type: Option<String>,
    pub model_confidence: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub optimal_threshold: f64,
    pub last_update: Option<String>,
    pub training_stats: TrainingStats,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortRisk {
    pub cohort: String,
    pub customer_count: i64,
    pub at_risk_count: i64,
    pub at_risk_percentage: f64,
    pub average_risk_score: f64,
    pub average_risk_score_at_risk: f64,
    pub ltv_at_risk: f64,
}

#[derive(Debug, Serialize)]
pub struct CohortsResponse {
    pub cohorts: Vec<CohortRisk>,
}

#[derive(Clone, Copy)]
pub struct ChurnService<'a> {
    db: &'a Database,
}

impl<'a> ChurnService<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    async fn fetch(&self, sql: &str, options: &ExecuteOptions) -> DashboardResult<Vec<Row>> {
        let rows = self.db.execute_query(sql, &[], options).await?;
        debug!(rows = rows.len(), "Churn query completed");
        Ok(rows.rows)
    }

    pub async fn summary(self) -> DashboardResult<ChurnSummary> {
        let summary = self
            .fetch(queries::SUMMARY, &ExecuteOptions::default())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DashboardError::unavailable("Service unavailable", "No summary data available")
            })?;

        let ltv = self
            .fetch(queries::LTV_AT_RISK, &ExecuteOptions::default())
            .await?;
        let total_ltv_at_risk = ltv.first().map(|row| float(row, "total_ltv_at_risk")).unwrap_or(0.0);

        let model = self.fetch(queries::ACTIVE_MODEL, &ExecuteOptions::max_rows(1)).await?;
        let model = model.first();

        Ok(ChurnSummary {
            at_risk_count: int(&summary, "at_risk_count"),
            total_customers: int(&summary, "total_customers"),
            at_risk_percentage: round2(float(&summary, "at_risk_percentage")),
            average_risk_score: round2(float(&summary, "average_risk_score")),
            total_ltv_at_risk: round2(total_ltv_at_risk),
            model_confidence: model.and_then(|row| row.get("auc_score")).and_then(Value::as_f64),
            last_update: model.and_then(|row| text(row, "training_date")),
            model_version: model.and_then(|row| text(row, "model_version")),
        })
    }

    pub async fn metrics(self) -> DashboardResult<ModelMetrics> {
        let rows = self.fetch(queries::ACTIVE_MODEL, &ExecuteOptions::max_rows(1)).await?;
        let model = rows
            .first()
            .ok_or_else(|| DashboardError::NotFound("Active model".to_string()))?;

        Ok(ModelMetrics {
            model_id: text(model, "model_id"),
            model_name: text(model, "model_name"),
            model_version: text(model, "model_version"),
            model_type: text(model, "model_type"),
            model_confidence: float(model, "auc_score"),
            accuracy: float(model, "accuracy"),
            precision: float(model, "precision_score"),
            recall: float(model, "recall_score"),
            f1_score: float(model, "f1_score"),
            optimal_threshold: float(model, "optimal_threshold"),
            last_update: text(model, "training_date"),
            training_stats: TrainingStats {
                train_samples: int(model, "train_samples"),
                test_samples: int(model, "test_samples"),
                feature_count: int(model, "feature_count"),
            },
            status: text(model, "status"),
        })
    }

    pub async fn cohorts(self) -> DashboardResult<CohortsResponse> {
        let rows = self.fetch(queries::COHORTS, &ExecuteOptions::default()).await?;

        let cohorts = rows
            .iter()
            .map(|row| {
                let customer_count = int(row, "customer_count");
                let at_risk_count = int(row, "at_risk_count");
                let at_risk_percentage = if customer_count > 0 {
                    round2(at_risk_count as f64 * 100.0 / customer_count as f64)
                } else {
                    0.0
                };
                CohortRisk {
                    cohort: text(row, "cohort").unwrap_or_default(),
                    customer_count,
                    at_risk_count,
                    at_risk_percentage,
                    average_risk_score: float(row, "avg_risk_score"),
                    average_risk_score_at_risk: float(row, "avg_risk_score_at_risk"),
                    ltv_at_risk: round2(float(row, "ltv_at_risk")),
                }
            })
            .collect();

        Ok(CohortsResponse { cohorts })
    }

    pub async fn chart_data(self, kind: ChartKind) -> DashboardResult<ChartData> {
        let data = match kind {
            ChartKind::CohortTrend => {
                return Ok(ChartData {
                    chart_type: kind.as_str(),
                    message: Some("Historical trend data not yet available".to_string()),
                    data: Vec::new(),
                })
            }
            ChartKind::Distribution => self
                .fetch(queries::RISK_DISTRIBUTION, &ExecuteOptions::default())
                .await?
                .iter()
                .map(|row| RiskBucket {
                    risk_range: text(row, "risk_range").unwrap_or_default(),
                    customer_count: int(row, "customer_count"),
                    at_risk_count: int(row, "at_risk_count"),
                })
                .collect(),
        };

        Ok(ChartData {
            chart_type: kind.as_str(),
            message: None,
            data,
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// Missing or null numeric columns read as zero
fn float(row: &Row, column: &str) -> f64 {
    row.get(column).and_then(Value::as_f64).unwrap_or(0.0)
}

fn int(row: &Row, column: &str) -> i64 {
    match row.get(column) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
