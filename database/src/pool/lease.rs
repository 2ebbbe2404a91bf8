// Leased connection with a single, guaranteed release

use tracing::{debug, warn};

use crate::driver::{DriverConnection, ExecuteOptions, PoolHandle, RowSet, SqlValue};
use crate::error::DriverError;

/// Where a leased connection came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    /// Borrowed from the shared pool; returned to it on release
    Pooled,
    /// Opened outside the pool as a fallback; closed on release
    Direct,
}

/// One backend session owned by a single task for a single execution
///
/// `release` consumes the lease, so it runs at most once. A lease dropped
/// without being released is cleaned up on the runtime in the background.
pub struct Lease {
    conn: Option<Box<dyn DriverConnection>>,
    origin: ConnectionOrigin,
    pool: Option<PoolHandle>,
    broken: bool,
}

impl Lease {
    pub(crate) fn pooled(conn: Box<dyn DriverConnection>, pool: PoolHandle) -> Self {
        Self {
            conn: Some(conn),
            origin: ConnectionOrigin::Pooled,
            pool: Some(pool),
            broken: false,
        }
    }

    pub(crate) fn direct(conn: Box<dyn DriverConnection>) -> Self {
        Self {
            conn: Some(conn),
            origin: ConnectionOrigin::Direct,
            pool: None,
            broken: false,
        }
    }

    pub fn origin(&self) -> ConnectionOrigin {
        self.origin
    }

    /// The pool this lease was taken from; `None` for direct connections
    pub fn pool(&self) -> Option<&PoolHandle> {
        self.pool.as_ref()
    }

    /// Whether the session failed with a broken-session error
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &ExecuteOptions,
    ) -> Result<RowSet, DriverError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(DriverError::other("lease has already been released"));
        };
        let result = conn.execute(sql, params, options).await;
        if let Err(err) = &result {
            if err.is_broken_session() {
                self.broken = true;
            }
        }
        result
    }

    /// Returns a healthy pooled session to its pool; closes everything else
    pub async fn release(mut self) -> Result<(), DriverError> {
        match self.conn.take() {
            Some(conn) => finalize(conn, self.origin, self.broken).await,
            None => Ok(()),
        }
    }
}

async fn finalize(
    conn: Box<dyn DriverConnection>,
    origin: ConnectionOrigin,
    broken: bool,
) -> Result<(), DriverError> {
    match (origin, broken) {
        (ConnectionOrigin::Pooled, false) => conn.release().await,
        // Broken sessions never go back to the pool; direct ones never join it
        (ConnectionOrigin::Pooled, true) | (ConnectionOrigin::Direct, _) => conn.discard().await,
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let origin = self.origin;
        let broken = self.broken;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(?origin, "Connection lease dropped without release");
                handle.spawn(async move {
                    if let Err(err) = finalize(conn, origin, broken).await {
                        debug!("Background lease release failed: {}", err);
                    }
                });
            }
            Err(_) => warn!(?origin, "Connection lease dropped outside a runtime"),
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("origin", &self.origin)
            .field("released", &self.conn.is_none())
            .field("broken", &self.broken)
            .finish()
    }
}
