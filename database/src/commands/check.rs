use std::error::Error;
use tracing::{error, info};

use kpi_database::{Database, DatabaseConfig};

/// Execute the check command
pub async fn execute() -> Result<(), Box<dyn Error>> {
    let config = DatabaseConfig::from_env();
    let db = Database::new(config);

    info!("Testing database connection...");
    let ok = db.test_connection().await;
    db.close_pool().await;

    if ok {
        info!("Database connection OK");
        Ok(())
    } else {
        error!("Database connection test failed");
        Err("database connection test failed".into())
    }
}
