// KPI Dashboard API server entry point

mod cache;
mod config;
mod error;
mod handlers;
mod routes;
mod services;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cache::ResponseCache;
use config::ApiConfig;
use handlers::AppState;
use kpi_database::{Database, DatabaseConfig};

fn load_env() {
    dotenv::dotenv().ok();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    load_env();
    // Configure logging with tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load API and database configuration from environment
    let config = ApiConfig::from_env();
    let db_config = DatabaseConfig::from_env();
    tracing::info!(?db_config, "Configuration loaded");

    let db = Database::new(db_config);

    // Warm the pool without blocking startup; failures defer to the first request
    {
        let db = db.clone();
        tokio::spawn(async move { db.initialize_pool().await });
    }

    let app_state = Arc::new(AppState {
        db: db.clone(),
        cache: ResponseCache::new(config.cache_ttl),
    });
    let app = routes::router(app_state);

    // Parse server address from config
    let addr: SocketAddr = config.server_addr().parse()?;

    // Start HTTP server
    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped, closing connection pool");
    db.close_pool().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received ctrl-c"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
