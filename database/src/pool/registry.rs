//! Process-wide pool registry
//!
//! Holds the single published pool and the in-flight creation marker. The
//! registry outlives any one `ConnectionPoolManager`, so a manager rebuilt
//! after a reload picks up the existing pool instead of creating another.
//! Only the pool manager mutates it.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::driver::PoolHandle;
use crate::error::{DbError, DriverError};

/// Drain allowed for a pool that finished building after shutdown
const ORPHAN_DRAIN: Duration = Duration::from_secs(1);

/// Lifecycle state of the shared pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// No pool and no creation in flight
    Uninitialized,
    /// Exactly one creation in flight; other callers await it
    Creating,
    /// A pool is published and assumed healthy
    Ready,
    /// The last pool was discarded after a broken session
    Degraded,
    /// A creation in flight that replaces a discarded pool
    Recreating,
    /// Shut down; the next request starts a fresh creation
    Closed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Uninitialized => "uninitialized",
            PoolState::Creating => "creating",
            PoolState::Ready => "ready",
            PoolState::Degraded => "degraded",
            PoolState::Recreating => "recreating",
            PoolState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub(crate) type CreationFuture = Shared<BoxFuture<'static, Result<PoolHandle, DbError>>>;

enum Slot {
    Empty,
    Creating {
        generation: u64,
        future: CreationFuture,
    },
    Ready {
        generation: u64,
        pool: PoolHandle,
    },
}

struct RegistryInner {
    slot: Slot,
    state: PoolState,
    next_generation: u64,
}

/// Result of looking up the pool
pub(crate) enum Lookup {
    Ready(PoolHandle),
    Pending(CreationFuture),
}

/// What shutdown has to wait for
pub(crate) enum Closing {
    Nothing,
    Pool(PoolHandle),
    /// A creation that will close its pool as soon as it completes
    Pending(CreationFuture),
}

enum Finished {
    Published(Result<PoolHandle, DbError>),
    /// Built after shutdown; closed by the creation future itself
    Orphaned(PoolHandle),
}

/// Shared home of the pool and its creation marker
pub struct PoolRegistry {
    inner: Mutex<RegistryInner>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<PoolRegistry>> = OnceLock::new();

impl PoolRegistry {
    /// A fresh, isolated registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                slot: Slot::Empty,
                state: PoolState::Uninitialized,
                next_generation: 1,
            }),
        })
    }

    /// The registry shared by the whole process
    pub fn global() -> Arc<Self> {
        GLOBAL_REGISTRY.get_or_init(PoolRegistry::new).clone()
    }

    pub fn state(&self) -> PoolState {
        self.inner.lock().state
    }

    /// The published pool, if any
    pub fn current(&self) -> Option<PoolHandle> {
        match &self.inner.lock().slot {
            Slot::Ready { pool, .. } => Some(pool.clone()),
            Slot::Empty | Slot::Creating { .. } => None,
        }
    }

    /// Number of pool generations started so far
    pub fn generations(&self) -> u64 {
        self.inner.lock().next_generation - 1
    }

    /// Returns the published pool, joins the in-flight creation, or
    /// publishes a new creation built by `create`.
    ///
    /// The check and the publish happen under one lock with no await in
    /// between, so concurrent callers can never start two creations.
    pub(crate) fn lookup_or_begin<F>(self: &Arc<Self>, create: F) -> Lookup
    where
        F: FnOnce() -> BoxFuture<'static, Result<PoolHandle, DbError>>,
    {
        let mut inner = self.inner.lock();
        match &inner.slot {
            Slot::Ready { pool, .. } => return Lookup::Ready(pool.clone()),
            Slot::Creating { future, .. } => return Lookup::Pending(future.clone()),
            Slot::Empty => {}
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.state = match inner.state {
            PoolState::Degraded => PoolState::Recreating,
            _ => PoolState::Creating,
        };

        let registry = Arc::clone(self);
        let creation = create();
        let future = async move {
            let outcome = creation.await;
            match registry.finish_creation(generation, outcome) {
                Finished::Published(result) => result,
                Finished::Orphaned(pool) => {
                    debug!(generation, "Closing pool created after shutdown");
                    if let Err(err) = pool.close(ORPHAN_DRAIN).await {
                        debug!("Closing orphaned pool failed: {}", err);
                    }
                    Err(DbError::BrokenSession(DriverError::broken_session(
                        "pool was closed while it was being created",
                    )))
                }
            }
        }
        .boxed()
        .shared();

        inner.slot = Slot::Creating {
            generation,
            future: future.clone(),
        };
        debug!(generation, state = %inner.state, "Pool creation published");
        Lookup::Pending(future)
    }

    /// Clears the creation marker and publishes the outcome
    fn finish_creation(&self, generation: u64, outcome: Result<PoolHandle, DbError>) -> Finished {
        let mut inner = self.inner.lock();
        let current = matches!(
            &inner.slot,
            Slot::Creating { generation: g, .. } if *g == generation
        );

        if !current {
            // Shut down while the creation was in flight
            return match outcome {
                Ok(pool) => Finished::Orphaned(pool),
                Err(_) => Finished::Published(Err(DbError::BrokenSession(
                    DriverError::broken_session("pool was closed while it was being created"),
                ))),
            };
        }

        Finished::Published(match outcome {
            Ok(pool) => {
                inner.slot = Slot::Ready {
                    generation,
                    pool: pool.clone(),
                };
                inner.state = PoolState::Ready;
                Ok(pool)
            }
            Err(err) => {
                inner.slot = Slot::Empty;
                inner.state = match inner.state {
                    PoolState::Recreating => PoolState::Degraded,
                    _ => PoolState::Uninitialized,
                };
                Err(err)
            }
        })
    }

    /// Unpublishes `pool` if it is still the current one
    pub(crate) fn discard(&self, pool: &PoolHandle) -> bool {
        let mut inner = self.inner.lock();
        let matches = matches!(
            &inner.slot,
            Slot::Ready { pool: current, .. } if Arc::ptr_eq(current, pool)
        );
        if matches {
            if let Slot::Ready { generation, .. } = inner.slot {
                debug!(generation, "Pool discarded");
            }
            inner.slot = Slot::Empty;
            inner.state = PoolState::Degraded;
        }
        matches
    }

    /// Clears the registry for shutdown
    ///
    /// Hands back the published pool, or the in-flight creation so the
    /// caller can wait for it and let it close its own result. Leaves the
    /// state untouched when there is nothing to close.
    pub(crate) fn take_for_close(&self) -> Closing {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.slot, Slot::Empty) {
            Slot::Ready { pool, .. } => {
                inner.state = PoolState::Closed;
                Closing::Pool(pool)
            }
            Slot::Creating { future, .. } => {
                inner.state = PoolState::Closed;
                Closing::Pending(future)
            }
            Slot::Empty => Closing::Nothing,
        }
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("state", &self.state())
            .field("generations", &self.generations())
            .finish()
    }
}
