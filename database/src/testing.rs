//! In-memory driver for exercising pool behaviour without a database

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::DatabaseConfig;
use crate::driver::{
    ClientMode, ClientSettings, ConnectSettings, Driver, DriverConnection, DriverPool,
    ExecuteOptions, PoolHandle, PoolSettings, Row, RowSet, SqlValue,
};
use crate::error::DriverError;
use crate::pool::RetryPolicy;

/// Statement the mock treats as a connection probe
pub const VALIDATION_SQL: &str = "SELECT 1";

/// How long a statement containing `pg_sleep` holds its connection
pub const SLOW_STATEMENT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct MockState {
    create_calls: AtomicUsize,
    init_calls: AtomicUsize,
    direct_calls: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
    pools_closed: AtomicUsize,
    create_delay: Mutex<Duration>,
    create_failures: Mutex<VecDeque<DriverError>>,
    validation_failures: Mutex<VecDeque<DriverError>>,
    statement_failures: Mutex<VecDeque<DriverError>>,
    direct_failure: Mutex<Option<DriverError>>,
    responses: Mutex<HashMap<String, Vec<Row>>>,
    executed: Mutex<Vec<(String, Vec<SqlValue>)>>,
    last_pool_settings: Mutex<Option<PoolSettings>>,
}

/// Scriptable driver that counts every primitive call
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every pool creation so concurrent callers overlap
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.state.create_delay.lock() = delay;
        self
    }

    /// Canned rows for a statement
    pub fn respond(&self, sql: &str, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self.state.responses.lock().insert(sql.to_string(), rows);
    }

    pub fn fail_next_create(&self, err: DriverError) {
        self.state.create_failures.lock().push_back(err);
    }

    /// Makes the next `count` validation probes fail with `err`
    pub fn fail_validations(&self, count: usize, err: DriverError) {
        let mut failures = self.state.validation_failures.lock();
        for _ in 0..count {
            failures.push_back(err.clone());
        }
    }

    pub fn fail_next_statement(&self, err: DriverError) {
        self.state.statement_failures.lock().push_back(err);
    }

    pub fn fail_direct(&self, err: DriverError) {
        *self.state.direct_failure.lock() = Some(err);
    }

    pub fn create_calls(&self) -> usize {
        self.state.create_calls.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.state.init_calls.load(Ordering::SeqCst)
    }

    pub fn direct_calls(&self) -> usize {
        self.state.direct_calls.load(Ordering::SeqCst)
    }

    /// Connections handed out, pooled and direct
    pub fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    /// Connections returned to a pool
    pub fn released(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }

    /// Connections closed outright
    pub fn discarded(&self) -> usize {
        self.state.discarded.load(Ordering::SeqCst)
    }

    pub fn pools_closed(&self) -> usize {
        self.state.pools_closed.load(Ordering::SeqCst)
    }

    /// Non-probe statements in execution order
    pub fn executed(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.state.executed.lock().clone()
    }

    pub fn last_pool_settings(&self) -> Option<PoolSettings> {
        self.state.last_pool_settings.lock().clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn init_client(&self, settings: &ClientSettings) -> Result<ClientMode, DriverError> {
        self.state.init_calls.fetch_add(1, Ordering::SeqCst);
        ClientMode::resolve(settings)
    }

    async fn create_pool(&self, settings: &PoolSettings) -> Result<PoolHandle, DriverError> {
        self.state.create_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.last_pool_settings.lock() = Some(settings.clone());

        let delay = *self.state.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.state.create_failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        Ok(Arc::new(MockPool {
            state: self.state.clone(),
            permits: Arc::new(Semaphore::new(settings.max as usize)),
            queue_timeout: settings.queue_timeout,
            closed: AtomicBool::new(false),
        }))
    }

    async fn connect_direct(
        &self,
        _settings: &ConnectSettings,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        self.state.direct_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.state.direct_failure.lock().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            _permit: None,
        }))
    }
}

struct MockPool {
    state: Arc<MockState>,
    permits: Arc<Semaphore>,
    queue_timeout: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl DriverPool for MockPool {
    async fn acquire(&self) -> Result<Box<dyn DriverConnection>, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::broken_session("pool is closed"));
        }

        let permit =
            match tokio::time::timeout(self.queue_timeout, self.permits.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DriverError::broken_session("pool is closed")),
                Err(_) => {
                    return Err(DriverError::acquire_timeout(
                        "timed out waiting in the pool queue",
                    ))
                }
            };

        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            _permit: Some(permit),
        }))
    }

    async fn close(&self, _drain: Duration) -> Result<(), DriverError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.permits.close();
            self.state.pools_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MockConnection {
    state: Arc<MockState>,
    // Held for the connection's lifetime so pool capacity is enforced
    _permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &ExecuteOptions,
    ) -> Result<RowSet, DriverError> {
        if sql == VALIDATION_SQL {
            let failure = self.state.validation_failures.lock().pop_front();
            return match failure {
                Some(err) => Err(err),
                None => Ok(RowSet::new(vec![object(json!({ "?column?": 1 }))])),
            };
        }

        self.state
            .executed
            .lock()
            .push((sql.to_string(), params.to_vec()));

        let failure = self.state.statement_failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        if sql.contains("pg_sleep") {
            tokio::time::sleep(SLOW_STATEMENT).await;
            return Ok(RowSet::default());
        }

        let mut rows = match self.state.responses.lock().get(sql) {
            Some(rows) => rows.clone(),
            None if sql == crate::TEST_QUERY => vec![object(json!({ "test": 1 }))],
            None => Vec::new(),
        };
        if let Some(limit) = options.max_rows {
            rows.truncate(limit);
        }
        Ok(RowSet::new(rows))
    }

    async fn release(self: Box<Self>) -> Result<(), DriverError> {
        self.state.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn discard(self: Box<Self>) -> Result<(), DriverError> {
        self.state.discarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Configuration pointing at the mock with a short queue timeout
pub fn test_config() -> DatabaseConfig {
    let mut config = DatabaseConfig::new("mock.internal:5432/kpi", "analytics", "secret");
    config.pool.queue_timeout = Duration::from_secs(2);
    config.pool.drain_timeout = Duration::from_secs(1);
    config
}

/// Retry policy with millisecond backoff
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_delays(Duration::from_millis(10), Duration::from_millis(40))
}
