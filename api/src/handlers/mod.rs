// Handlers Module
// This module contains the API endpoint handlers

pub mod churn;
pub mod health;

use std::sync::Arc;

use kpi_database::Database;

use crate::cache::ResponseCache;

/// Shared state handed to every handler
pub struct AppState {
    pub db: Database,
    pub cache: ResponseCache,
}

// Type alias for the application state
pub type SharedState = Arc<AppState>;

pub use churn::{
    get_churn_chart_data, get_churn_cohorts, get_churn_metrics, get_churn_summary,
};
pub use health::health_check;
