//! Database access for the KPI dashboard.
//!
//! A single bounded connection pool is shared by every request handler in
//! the process. [`ConnectionPoolManager`] creates it lazily (exactly once,
//! however many callers race), validates every connection before handing
//! it out, recreates the pool when the backend drops sessions, and falls
//! back to one direct connection when the pool cannot serve a request.
//! [`QueryExecutor`] runs one statement per leased connection and always
//! releases it.

pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod pool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

use tracing::{error, info, warn};

pub use config::{DatabaseConfig, PoolSizing};
pub use driver::{ExecuteOptions, PgDriver, Row, RowSet, SqlValue};
pub use error::{AcquireStage, DbError, DriverError, DriverErrorKind};
pub use executor::QueryExecutor;
pub use pool::{ConnectionOrigin, ConnectionPoolManager, Lease, PoolRegistry, PoolState, RetryPolicy};

/// Statement used by [`Database::test_connection`]
pub const TEST_QUERY: &str = "SELECT 1 AS test";

/// Entry point used by route handlers and health checks
#[derive(Debug, Clone)]
pub struct Database {
    executor: QueryExecutor,
}

impl Database {
    /// Postgres-backed database using the process-wide pool registry
    pub fn new(config: DatabaseConfig) -> Self {
        Self::with_driver(config, Arc::new(PgDriver::new()))
    }

    pub fn with_driver(config: DatabaseConfig, driver: Arc<dyn driver::Driver>) -> Self {
        Self::from_manager(ConnectionPoolManager::new(config, driver))
    }

    pub fn from_manager(manager: ConnectionPoolManager) -> Self {
        Self {
            executor: QueryExecutor::new(manager),
        }
    }

    pub fn manager(&self) -> &ConnectionPoolManager {
        self.executor.manager()
    }

    pub fn config(&self) -> &DatabaseConfig {
        self.manager().config()
    }

    pub fn state(&self) -> PoolState {
        self.manager().state()
    }

    /// Runs one statement; an empty `params` slice is passed through as-is
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &ExecuteOptions,
    ) -> Result<RowSet, DbError> {
        self.executor.execute(sql, params, options).await
    }

    /// Whether a trivial statement round-trips successfully
    pub async fn test_connection(&self) -> bool {
        let config = self.config();
        if !config.has_required() {
            error!(
                has_connection_string = config.connection_string.is_some(),
                has_password = config.password.is_some(),
                has_credential_bundle = config.credential_bundle.is_some(),
                "Missing database environment variables"
            );
            return false;
        }

        match self
            .execute_query(TEST_QUERY, &[], &ExecuteOptions::default())
            .await
        {
            Ok(rows) => !rows.is_empty(),
            Err(err) => {
                let diag = err.driver_error();
                error!(
                    code = ?diag.and_then(|d| d.code.as_deref()),
                    number = ?diag.and_then(|d| d.number),
                    "Connection test failed: {}",
                    err
                );
                false
            }
        }
    }

    /// Warms the pool at startup; failure only defers creation to the first request
    pub async fn initialize_pool(&self) {
        info!("Initializing connection pool at startup");
        match self.manager().get_pool().await {
            Ok(_) => info!("Connection pool initialized and ready"),
            Err(err) => {
                error!("Failed to initialize connection pool at startup: {}", err);
                warn!("Pool will be created lazily on first request");
            }
        }
    }

    /// Graceful shutdown of the shared pool
    pub async fn close_pool(&self) {
        self.manager().close_pool().await
    }
}
