// Pool lifecycle management

mod lease;
mod manager;
mod registry;
mod retry;

#[cfg(test)]
mod tests;

pub use lease::{ConnectionOrigin, Lease};
pub use manager::ConnectionPoolManager;
pub use registry::{PoolRegistry, PoolState};
pub use retry::RetryPolicy;
