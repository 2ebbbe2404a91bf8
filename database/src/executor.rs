// Single-statement execution over a leased connection

use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::driver::{ExecuteOptions, RowSet, SqlValue};
use crate::error::DbError;
use crate::pool::ConnectionPoolManager;

/// Runs one parameterized statement per lease, always releasing the lease
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    manager: ConnectionPoolManager,
}

impl QueryExecutor {
    pub fn new(manager: ConnectionPoolManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ConnectionPoolManager {
        &self.manager
    }

    /// Executes `sql` with positional `params`, returning object-shaped rows
    ///
    /// A broken session mid-statement invalidates the pool and reruns the
    /// whole acquire-and-execute cycle, bounded by the retry policy.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &ExecuteOptions,
    ) -> Result<RowSet, DbError> {
        let policy = self.manager.retry_policy().clone();
        let mut attempt = 0;

        loop {
            let final_attempt = attempt >= policy.query_retries;
            let connection_retries = if final_attempt {
                0
            } else {
                policy.connection_retries
            };

            let mut lease = self.manager.get_connection(connection_retries).await?;
            let outcome = lease.execute(sql, params, options).await;
            let pool = lease.pool().cloned();
            if let Err(err) = lease.release().await {
                debug!("Releasing connection failed: {}", err);
            }

            let err = match outcome {
                Ok(rows) => return Ok(rows),
                Err(err) => self.manager.classify(err),
            };

            if err.is_broken_session() {
                if let Some(pool) = &pool {
                    self.manager.invalidate(pool);
                }
            }

            if policy.is_retryable(&err) && !final_attempt {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.query_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Query failed with connection error, retrying: {}",
                    err
                );
                sleep(delay).await;
                attempt += 1;
                continue;
            }

            let diag = err.driver_error();
            error!(
                code = ?diag.and_then(|d| d.code.as_deref()),
                number = ?diag.and_then(|d| d.number),
                "Query execution failed: {}",
                err
            );
            return Err(err);
        }
    }
}
