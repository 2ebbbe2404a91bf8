//! Tests for pool lifecycle behaviour against the mock driver

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use super::{ConnectionOrigin, ConnectionPoolManager, PoolRegistry, PoolState};
use crate::config::DatabaseConfig;
use crate::driver::ExecuteOptions;
use crate::error::{AcquireStage, DbError, DriverError};
use crate::executor::QueryExecutor;
use crate::testing::{fast_retry, test_config, MockDriver};

fn manager_with(
    config: DatabaseConfig,
    driver: &MockDriver,
    registry: &Arc<PoolRegistry>,
) -> ConnectionPoolManager {
    ConnectionPoolManager::with_registry(config, Arc::new(driver.clone()), registry.clone())
        .with_retry_policy(fast_retry())
}

fn manager(driver: &MockDriver, registry: &Arc<PoolRegistry>) -> ConnectionPoolManager {
    manager_with(test_config(), driver, registry)
}

fn broken() -> DriverError {
    DriverError::broken_session("end-of-file on communication channel").with_code("08006")
}

/// Lets spawned background work (pool closes, lease cleanup) run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_create_one_pool() {
    let driver = MockDriver::new().with_create_delay(Duration::from_millis(50));
    let registry = PoolRegistry::new();
    let mut config = test_config();
    config.pool.max = 32;
    let manager = manager_with(config, &driver, &registry);

    let results = join_all((0..16).map(|_| manager.get_connection(2))).await;

    assert_eq!(driver.create_calls(), 1);
    let pool = registry.current().expect("published pool");
    for result in results {
        let lease = result.expect("lease");
        assert_eq!(lease.origin(), ConnectionOrigin::Pooled);
        assert!(Arc::ptr_eq(lease.pool().expect("pooled lease"), &pool));
        lease.release().await.expect("release");
    }
    assert_eq!(manager.state(), PoolState::Ready);
    assert_eq!(driver.released(), 16);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_managers_share_one_creation() {
    let driver = MockDriver::new().with_create_delay(Duration::from_millis(50));
    let registry = PoolRegistry::new();

    // Independent manager instances, as after a reload of the calling code
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager(&driver, &registry);
            tokio::spawn(async move { manager.get_pool().await })
        })
        .collect();

    let pools: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task").expect("pool"))
        .collect();

    assert_eq!(driver.create_calls(), 1);
    assert!(pools.iter().all(|pool| Arc::ptr_eq(pool, &pools[0])));
    assert_eq!(registry.generations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_creation_failure_reaches_every_waiter_then_clears() {
    let driver = MockDriver::new().with_create_delay(Duration::from_millis(20));
    driver.fail_next_create(DriverError::other("permission denied for database kpi").with_code("42501"));
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    let results = join_all((0..5).map(|_| manager.get_pool())).await;

    assert_eq!(driver.create_calls(), 1);
    for result in results {
        match result {
            Err(DbError::Driver(err)) => assert_eq!(err.code.as_deref(), Some("42501")),
            other => panic!("expected driver error, got {:?}", other.map(|_| ())),
        }
    }
    assert_eq!(manager.state(), PoolState::Uninitialized);

    // The marker is gone, so the next call starts a new creation
    manager.get_pool().await.expect("pool after retry");
    assert_eq!(driver.create_calls(), 2);
    assert_eq!(manager.state(), PoolState::Ready);
}

#[tokio::test]
async fn test_reloaded_manager_reuses_registry_pool() {
    let registry = PoolRegistry::new();
    let first_driver = MockDriver::new();
    let first = manager(&first_driver, &registry);
    let pool = first.get_pool().await.expect("pool");

    let second_driver = MockDriver::new();
    let second = manager(&second_driver, &registry);
    let reused = second.get_pool().await.expect("pool");

    assert!(Arc::ptr_eq(&pool, &reused));
    assert_eq!(second_driver.create_calls(), 0);
    assert_eq!(first_driver.create_calls(), 1);
}

#[test]
fn test_global_registry_is_a_singleton() {
    assert!(Arc::ptr_eq(&PoolRegistry::global(), &PoolRegistry::global()));
}

#[tokio::test(start_paused = true)]
async fn test_broken_validation_recreates_pool() {
    let driver = MockDriver::new();
    driver.fail_validations(1, broken());
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    let lease = manager.get_connection(2).await.expect("healed lease");
    settle().await;

    assert_eq!(lease.origin(), ConnectionOrigin::Pooled);
    assert_eq!(driver.create_calls(), 2);
    assert_eq!(driver.discarded(), 1);
    assert_eq!(driver.pools_closed(), 1);
    assert_eq!(manager.state(), PoolState::Ready);
    assert!(Arc::ptr_eq(
        lease.pool().expect("pooled lease"),
        &registry.current().expect("published pool")
    ));

    lease.release().await.expect("release");
    assert_eq!(driver.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_back_off_exponentially() {
    let driver = MockDriver::new();
    driver.fail_validations(2, broken());
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    let start = Instant::now();
    let lease = manager.get_connection(2).await.expect("lease");

    // 10ms then 20ms with the fast policy
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(driver.create_calls(), 3);
    lease.release().await.expect("release");
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_one_direct_connection() {
    let driver = MockDriver::new();
    driver.fail_validations(3, broken());
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    let lease = manager.get_connection(2).await.expect("direct lease");

    assert_eq!(lease.origin(), ConnectionOrigin::Direct);
    assert!(lease.pool().is_none());
    assert_eq!(driver.direct_calls(), 1);
    assert_eq!(driver.create_calls(), 3);
    assert_eq!(manager.state(), PoolState::Degraded);

    lease.release().await.expect("release");
    // Three invalid pooled connections plus the direct one, none returned to a pool
    assert_eq!(driver.discarded(), 4);
    assert_eq!(driver.released(), 0);
    assert_eq!(driver.acquired(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_backend_at_creation_falls_back() {
    let driver = MockDriver::new();
    for _ in 0..3 {
        driver.fail_next_create(broken());
    }
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    let lease = manager.get_connection(2).await.expect("direct lease");

    assert_eq!(lease.origin(), ConnectionOrigin::Direct);
    assert_eq!(driver.create_calls(), 3);
    assert_eq!(driver.direct_calls(), 1);
    assert_eq!(manager.state(), PoolState::Uninitialized);
    lease.release().await.expect("release");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_fallback_names_direct_stage() {
    let driver = MockDriver::new();
    driver.fail_validations(3, broken());
    driver.fail_direct(DriverError::broken_session("connection refused"));
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    match manager.get_connection(2).await {
        Err(DbError::ConnectionFailed { stage, source }) => {
            assert_eq!(stage, AcquireStage::Direct);
            assert_eq!(source.message, "connection refused");
        }
        other => panic!("expected connection failure, got {:?}", other),
    }
    assert_eq!(driver.direct_calls(), 1);
    assert_eq!(driver.acquired(), driver.discarded());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_fallback_names_pooled_stage() {
    let driver = MockDriver::new();
    driver.fail_validations(1, broken());
    let registry = PoolRegistry::new();
    let mut config = test_config();
    config.direct_fallback = false;
    let manager = manager_with(config, &driver, &registry);

    match manager.get_connection(0).await {
        Err(DbError::ConnectionFailed { stage, .. }) => assert_eq!(stage, AcquireStage::Pooled),
        other => panic!("expected connection failure, got {:?}", other),
    }
    assert_eq!(driver.direct_calls(), 0);
}

#[tokio::test]
async fn test_generic_validation_error_is_not_retried() {
    let driver = MockDriver::new();
    driver.fail_validations(1, DriverError::other("permission denied for relation dual"));
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    let result = manager.get_connection(2).await;

    assert!(matches!(result, Err(DbError::Driver(_))));
    assert_eq!(driver.create_calls(), 1);
    assert_eq!(driver.direct_calls(), 0);
    assert_eq!(manager.state(), PoolState::Ready);
}

#[tokio::test]
async fn test_missing_config_fails_before_any_io() {
    let driver = MockDriver::new();
    let registry = PoolRegistry::new();
    let mut config = test_config();
    config.connection_string = None;
    let manager = manager_with(config, &driver, &registry);

    match manager.get_connection(2).await {
        Err(DbError::Configuration(msg)) => assert!(msg.contains("DB_CONNECTION_STRING")),
        other => panic!("expected configuration error, got {:?}", other),
    }
    assert_eq!(driver.init_calls(), 0);
    assert_eq!(driver.create_calls(), 0);
    assert_eq!(driver.direct_calls(), 0);
    assert_eq!(manager.state(), PoolState::Uninitialized);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_timeout_when_pool_is_exhausted() {
    let driver = MockDriver::new();
    let registry = PoolRegistry::new();
    let mut config = test_config();
    config.pool.max = 1;
    config.pool.queue_timeout = Duration::from_secs(2);
    let manager = manager_with(config, &driver, &registry);

    // A long-running query holds the only connection
    let executor = QueryExecutor::new(manager.clone());
    let slow = tokio::spawn(async move {
        executor
            .execute("SELECT pg_sleep(60)", &[], &ExecuteOptions::default())
            .await
    });
    settle().await;

    let start = Instant::now();
    let result = manager.get_connection(2).await;
    let waited = start.elapsed();

    match result {
        Err(DbError::AcquireTimeout(timeout)) => assert_eq!(timeout, Duration::from_secs(2)),
        other => panic!("expected acquire timeout, got {:?}", other),
    }
    assert!(waited >= Duration::from_secs(2));
    assert!(waited < Duration::from_secs(3));
    assert_eq!(driver.create_calls(), 1);
    assert_eq!(driver.direct_calls(), 0);

    slow.abort();
}

#[tokio::test]
async fn test_close_pool_is_idempotent() {
    let driver = MockDriver::new();
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    manager.close_pool().await;
    assert_eq!(manager.state(), PoolState::Uninitialized);
    assert_eq!(driver.pools_closed(), 0);

    manager.get_pool().await.expect("pool");
    manager.close_pool().await;
    manager.close_pool().await;
    assert_eq!(driver.pools_closed(), 1);
    assert_eq!(manager.state(), PoolState::Closed);
    assert!(registry.current().is_none());

    // Closed is not terminal for requests: the next one creates a fresh pool
    let lease = manager.get_connection(0).await.expect("lease after close");
    assert_eq!(driver.create_calls(), 2);
    assert_eq!(manager.state(), PoolState::Ready);
    lease.release().await.expect("release");
}

#[tokio::test(start_paused = true)]
async fn test_recreation_after_invalidation_is_reported() {
    let driver = MockDriver::new().with_create_delay(Duration::from_millis(50));
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    let pool = manager.get_pool().await.expect("pool");
    manager.invalidate(&pool);
    assert_eq!(manager.state(), PoolState::Degraded);

    // A stale handle does not discard the replacement
    let recreating = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get_pool().await })
    };
    settle().await;
    assert_eq!(manager.state(), PoolState::Recreating);

    let replacement = recreating.await.expect("task").expect("pool");
    manager.invalidate(&pool);
    assert_eq!(manager.state(), PoolState::Ready);
    assert!(Arc::ptr_eq(&replacement, &registry.current().expect("pool")));
}

#[tokio::test(start_paused = true)]
async fn test_close_during_creation_discards_the_new_pool() {
    let driver = MockDriver::new().with_create_delay(Duration::from_millis(50));
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    let creating = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get_pool().await })
    };
    settle().await;
    manager.close_pool().await;
    assert_eq!(manager.state(), PoolState::Closed);
    // Shutdown waited for the creation and its pool is already closed
    assert_eq!(driver.pools_closed(), 1);

    let result = creating.await.expect("task");
    assert!(matches!(result, Err(DbError::BrokenSession(_))));
    assert!(registry.current().is_none());

    manager.get_pool().await.expect("fresh pool");
    assert_eq!(manager.state(), PoolState::Ready);
}

#[tokio::test]
async fn test_pool_settings_follow_config() {
    let driver = MockDriver::new();
    let registry = PoolRegistry::new();
    let mut config = test_config();
    config.pool.min = 2;
    config.pool.max = 7;
    config.pool.increment = 3;
    config.pool.idle_timeout = Duration::from_secs(45);
    let manager = manager_with(config, &driver, &registry);

    manager.get_pool().await.expect("pool");

    let settings = driver.last_pool_settings().expect("settings");
    assert_eq!(settings.min, 2);
    assert_eq!(settings.max, 7);
    assert_eq!(settings.increment, 3);
    assert_eq!(settings.idle_timeout, Duration::from_secs(45));
    assert_eq!(settings.queue_timeout, Duration::from_secs(2));
    assert_eq!(settings.connect.username, "analytics");
    assert_eq!(driver.init_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_lease_is_released_in_background() {
    let driver = MockDriver::new();
    let registry = PoolRegistry::new();
    let manager = manager(&driver, &registry);

    let lease = manager.get_connection(0).await.expect("lease");
    drop(lease);
    settle().await;

    assert_eq!(driver.released(), 1);
    assert_eq!(driver.discarded(), 0);
}
