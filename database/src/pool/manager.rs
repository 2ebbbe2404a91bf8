// Connection pool lifecycle: lazy creation, healing, fallback and shutdown

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::lease::Lease;
use super::registry::{Closing, Lookup, PoolRegistry, PoolState};
use super::retry::RetryPolicy;
use crate::config::DatabaseConfig;
use crate::driver::{ClientMode, Driver, DriverConnection, ExecuteOptions, PoolHandle};
use crate::error::{AcquireStage, DbError, DriverError, DriverErrorKind};

/// Drain allowed for a pool discarded after a broken session
const BROKEN_POOL_DRAIN: Duration = Duration::from_secs(5);

/// Hands out validated connections from one shared, self-healing pool
#[derive(Clone)]
pub struct ConnectionPoolManager {
    registry: Arc<PoolRegistry>,
    driver: Arc<dyn Driver>,
    config: Arc<DatabaseConfig>,
    policy: RetryPolicy,
}

impl ConnectionPoolManager {
    /// Creates a manager bound to the process-wide registry
    pub fn new(config: DatabaseConfig, driver: Arc<dyn Driver>) -> Self {
        Self::with_registry(config, driver, PoolRegistry::global())
    }

    /// Creates a manager bound to an explicit registry
    pub fn with_registry(
        config: DatabaseConfig,
        driver: Arc<dyn Driver>,
        registry: Arc<PoolRegistry>,
    ) -> Self {
        Self {
            registry,
            driver,
            config: Arc::new(config),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn state(&self) -> PoolState {
        self.registry.state()
    }

    /// Returns the shared pool, creating it at most once across all callers
    pub async fn get_pool(&self) -> Result<PoolHandle, DbError> {
        match self.registry.lookup_or_begin(|| self.creation()) {
            Lookup::Ready(pool) => Ok(pool),
            Lookup::Pending(creation) => creation.await,
        }
    }

    fn creation(&self) -> BoxFuture<'static, Result<PoolHandle, DbError>> {
        let manager = self.clone();
        async move { manager.create_pool().await }.boxed()
    }

    async fn create_pool(&self) -> Result<PoolHandle, DbError> {
        let settings = self.config.pool_settings().map_err(|err| {
            error!("Cannot create connection pool: {}", err);
            err
        })?;
        let mode = self.init_client()?;

        info!(
            min = settings.min,
            max = settings.max,
            increment = settings.increment,
            mode = %mode,
            "Creating database connection pool"
        );

        match self.driver.create_pool(&settings.with_client_mode(mode)).await {
            Ok(pool) => {
                info!("Database connection pool created");
                Ok(pool)
            }
            Err(err) => {
                error!(
                    code = ?err.code,
                    number = ?err.number,
                    "Failed to create connection pool: {}",
                    err.message
                );
                Err(self.classify(err))
            }
        }
    }

    fn init_client(&self) -> Result<ClientMode, DbError> {
        self.driver
            .init_client(&self.config.client_settings())
            .map_err(|err| {
                error!("Database client initialization failed: {}", err);
                DbError::Configuration(format!("client initialization failed: {}", err))
            })
    }

    /// Maps a driver error onto the manager's failure classes
    pub fn classify(&self, err: DriverError) -> DbError {
        match err.kind {
            DriverErrorKind::BrokenSession => DbError::BrokenSession(err),
            DriverErrorKind::AcquireTimeout => DbError::AcquireTimeout(self.config.pool.queue_timeout),
            DriverErrorKind::Other => DbError::Driver(err),
        }
    }

    /// Leases a validated connection: pooled first, then a direct fallback
    pub async fn get_connection(&self, max_retries: u32) -> Result<Lease, DbError> {
        match self.acquire_pooled(max_retries).await {
            Ok(lease) => Ok(lease),
            Err(DbError::BrokenSession(source)) => {
                if !self.config.direct_fallback {
                    error!("Pooled acquisition exhausted and direct fallback is disabled");
                    return Err(DbError::ConnectionFailed {
                        stage: AcquireStage::Pooled,
                        source,
                    });
                }
                warn!(
                    "Pool connection failed, trying direct connection: {}",
                    source.message
                );
                self.acquire_direct().await
            }
            Err(err) => Err(err),
        }
    }

    /// Pooled stage: acquire and validate, recreating the pool on broken sessions
    pub async fn acquire_pooled(&self, max_retries: u32) -> Result<Lease, DbError> {
        let mut attempt = 0;
        loop {
            let err = match self.checkout().await {
                Ok(lease) => return Ok(lease),
                Err(err) => err,
            };

            if !self.policy.is_retryable(&err) || attempt >= max_retries {
                return Err(err);
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts = max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                "Pooled connection broken, recreating pool: {}",
                err
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn checkout(&self) -> Result<Lease, DbError> {
        let pool = self.get_pool().await?;

        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                let err = self.classify(err);
                if err.is_broken_session() {
                    self.invalidate(&pool);
                }
                return Err(err);
            }
        };

        match self.validate(conn.as_mut()).await {
            Ok(()) => Ok(Lease::pooled(conn, pool)),
            Err(err) => {
                if let Err(close_err) = conn.discard().await {
                    debug!("Closing invalid connection failed: {}", close_err);
                }
                let err = self.classify(err);
                if err.is_broken_session() {
                    self.invalidate(&pool);
                } else {
                    error!(
                        code = ?err.driver_error().and_then(|e| e.code.clone()),
                        "Connection validation failed: {}",
                        err
                    );
                }
                Err(err)
            }
        }
    }

    /// Direct stage: one unpooled, validated connection with the same credentials
    pub async fn acquire_direct(&self) -> Result<Lease, DbError> {
        let settings = self.config.connect_settings()?;
        let mode = self.init_client()?;
        let settings = settings.with_client_mode(mode);

        // Same bound as a pooled acquire
        let timeout = self.config.pool.queue_timeout;
        let connect = tokio::time::timeout(timeout, self.driver.connect_direct(&settings)).await;
        let mut conn = match connect {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => return Err(self.direct_failure(err, &settings.client_mode)),
            Err(_) => {
                let err = DriverError::broken_session(format!(
                    "direct connection not established within {:?}",
                    timeout
                ));
                return Err(self.direct_failure(err, &settings.client_mode));
            }
        };

        if let Err(err) = self.validate(conn.as_mut()).await {
            if let Err(close_err) = conn.discard().await {
                debug!("Closing invalid direct connection failed: {}", close_err);
            }
            return Err(self.direct_failure(err, &settings.client_mode));
        }

        info!("Direct connection established");
        Ok(Lease::direct(conn))
    }

    fn direct_failure(&self, err: DriverError, mode: &ClientMode) -> DbError {
        error!(
            code = ?err.code,
            number = ?err.number,
            connection_string = self.config.connection_string.as_deref().unwrap_or_default(),
            credential_bundle = ?self.config.credential_bundle,
            mode = %mode,
            "Direct connection failed: {}",
            err.message
        );
        DbError::ConnectionFailed {
            stage: AcquireStage::Direct,
            source: err,
        }
    }

    async fn validate(&self, conn: &mut dyn DriverConnection) -> Result<(), DriverError> {
        conn.execute(&self.config.validation_query, &[], &ExecuteOptions::default())
            .await
            .map(|_| ())
    }

    /// Discards `pool` if it is still the shared one; the next request recreates it
    pub fn invalidate(&self, pool: &PoolHandle) {
        if !self.registry.discard(pool) {
            return;
        }
        warn!("Connection pool marked unhealthy, it will be recreated");
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(err) = pool.close(BROKEN_POOL_DRAIN).await {
                debug!("Closing discarded pool failed: {}", err);
            }
        });
    }

    /// Closes the shared pool with a bounded drain; never fails
    ///
    /// A creation still in flight is awaited within the same bound so the
    /// pool it produces is closed before this returns.
    pub async fn close_pool(&self) {
        let drain = self.config.pool.drain_timeout;
        let pool = match self.registry.take_for_close() {
            Closing::Nothing => {
                debug!("No connection pool to close");
                return;
            }
            Closing::Pending(creation) => {
                info!("Waiting for in-flight pool creation before shutdown");
                if tokio::time::timeout(drain, creation).await.is_err() {
                    error!(
                        drain_secs = drain.as_secs(),
                        "Pool creation did not finish within the drain timeout"
                    );
                }
                return;
            }
            Closing::Pool(pool) => pool,
        };

        match tokio::time::timeout(drain, pool.close(drain)).await {
            Ok(Ok(())) => info!("Database connection pool closed"),
            Ok(Err(err)) => error!("Error closing connection pool: {}", err),
            Err(_) => error!(
                drain_secs = drain.as_secs(),
                "Connection pool did not close within the drain timeout"
            ),
        }
    }
}

impl std::fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish()
    }
}
