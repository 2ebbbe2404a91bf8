use std::error::Error;
use tracing::{error, info};

use kpi_database::{Database, DatabaseConfig, ExecuteOptions, SqlValue};

/// Execute the query command, printing the rows as JSON
pub async fn execute(
    sql: String,
    params: Vec<String>,
    max_rows: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    let config = DatabaseConfig::from_env();
    let db = Database::new(config);

    let params: Vec<SqlValue> = params.iter().map(|p| SqlValue::parse_literal(p)).collect();
    let options = ExecuteOptions { max_rows };

    info!("Running query with {} parameter(s)", params.len());
    let result = db.execute_query(&sql, &params, &options).await;
    db.close_pool().await;

    match result {
        Ok(rows) => {
            info!("Query returned {} row(s)", rows.len());
            println!("{}", serde_json::to_string_pretty(&rows.rows)?);
            Ok(())
        }
        Err(e) => {
            error!("Query failed: {}", e);
            Err(Box::new(e))
        }
    }
}
