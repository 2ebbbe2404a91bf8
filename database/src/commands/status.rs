use std::error::Error;
use tracing::info;

use kpi_database::{Database, DatabaseConfig};

/// Show configuration and pool status
pub async fn execute() -> Result<(), Box<dyn Error>> {
    let config = DatabaseConfig::from_env();

    println!("Database configuration:");
    println!(
        "  connection string: {}",
        config.connection_string.as_deref().unwrap_or("<not set>")
    );
    println!("  username:          {}", config.username);
    println!(
        "  password:          {}",
        if config.password.is_some() { "<set>" } else { "<not set>" }
    );
    println!(
        "  credential bundle: {}",
        config
            .credential_bundle
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<not set>".to_string())
    );
    println!(
        "  pool:              min={} max={} increment={} idle={}s queue={}ms",
        config.pool.min,
        config.pool.max,
        config.pool.increment,
        config.pool.idle_timeout.as_secs(),
        config.pool.queue_timeout.as_millis()
    );
    println!("  direct fallback:   {}", config.direct_fallback);

    let db = Database::new(config);
    info!("Initializing pool to report its state");
    db.initialize_pool().await;
    println!("Pool state: {}", db.state());
    println!(
        "Connection test: {}",
        if db.test_connection().await { "ok" } else { "failed" }
    );

    db.close_pool().await;
    println!("Pool state after shutdown: {}", db.state());
    Ok(())
}
