// Database configuration loaded from environment variables

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenv::dotenv;

use crate::driver::{ClientSettings, ConnectSettings, PoolSettings};
use crate::error::DbError;

const DEFAULT_USERNAME: &str = "analytics";
const DEFAULT_VALIDATION_QUERY: &str = "SELECT 1";

/// Pool sizing and timeout settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSizing {
    pub min: u32,
    pub max: u32,
    /// Connections opened per growth step
    pub increment: u32,
    /// Idle connections are closed after this long
    pub idle_timeout: Duration,
    /// Callers waiting on an exhausted pool fail after this long
    pub queue_timeout: Duration,
    /// Upper bound on graceful shutdown
    pub drain_timeout: Duration,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            min: 1,
            max: 5,
            increment: 1,
            idle_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_millis(30_000),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection settings for the analytics warehouse
///
/// Credentials are optional here; their presence is checked when a pool or
/// direct connection is actually requested so the process can start
/// without them.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// `postgres://` URL or `host[:port][/database]`
    pub connection_string: Option<String>,
    pub username: String,
    pub password: Option<String>,
    /// Directory holding TLS material (`root.crt`, `client.crt`, `client.key`)
    pub credential_bundle: Option<PathBuf>,
    pub pool: PoolSizing,
    /// Round-trip statement used to validate connections before use
    pub validation_query: String,
    /// Open an unpooled connection when the pool cannot serve one
    pub direct_fallback: bool,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("connection_string", &self.connection_string)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("credential_bundle", &self.credential_bundle)
            .field("pool", &self.pool)
            .field("validation_query", &self.validation_query)
            .field("direct_fallback", &self.direct_fallback)
            .finish()
    }
}

impl DatabaseConfig {
    /// Creates a configuration with default pool settings
    pub fn new(
        connection_string: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            connection_string: Some(connection_string.into()),
            username: username.into(),
            password: Some(password.into()),
            credential_bundle: None,
            pool: PoolSizing::default(),
            validation_query: DEFAULT_VALIDATION_QUERY.to_string(),
            direct_fallback: true,
        }
    }

    /// Load database configuration from environment variables
    pub fn from_env() -> Self {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank values count as unset
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };

        // Out-of-range counts are as bad as unparseable ones
        let count = |key: &str, default: u32| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(default)
        };

        let defaults = PoolSizing::default();
        let min = count("DB_POOL_MIN", defaults.min);
        // A pool must hold at least one connection and never less than its minimum
        let max = count("DB_POOL_MAX", defaults.max).max(min).max(1);
        let increment = count("DB_POOL_INCREMENT", defaults.increment).max(1);

        let pool = PoolSizing {
            min,
            max,
            increment,
            idle_timeout: Duration::from_secs(number(
                "DB_POOL_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )),
            queue_timeout: Duration::from_millis(number(
                "DB_POOL_QUEUE_TIMEOUT_MS",
                defaults.queue_timeout.as_millis() as u64,
            )),
            drain_timeout: Duration::from_secs(number(
                "DB_POOL_DRAIN_TIMEOUT_SECS",
                defaults.drain_timeout.as_secs(),
            )),
        };

        let direct_fallback = get("DB_DIRECT_FALLBACK")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);

        Self {
            connection_string: get("DB_CONNECTION_STRING"),
            username: get("DB_USERNAME").unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
            password: get("DB_PASSWORD"),
            credential_bundle: get("DB_CREDENTIAL_BUNDLE").map(PathBuf::from),
            pool,
            validation_query: get("DB_VALIDATION_QUERY")
                .unwrap_or_else(|| DEFAULT_VALIDATION_QUERY.to_string()),
            direct_fallback,
        }
    }

    /// Whether both the connection string and the password are present
    pub fn has_required(&self) -> bool {
        self.connection_string.is_some() && self.password.is_some()
    }

    /// Credentials for one connection, failing fast if any are missing
    pub fn connect_settings(&self) -> Result<ConnectSettings, DbError> {
        match (&self.connection_string, &self.password) {
            (Some(connection_string), Some(password)) => Ok(ConnectSettings {
                connection_string: connection_string.clone(),
                username: self.username.clone(),
                password: password.clone(),
                client_mode: Default::default(),
            }),
            (connection_string, password) => {
                let mut missing = Vec::new();
                if connection_string.is_none() {
                    missing.push("DB_CONNECTION_STRING");
                }
                if password.is_none() {
                    missing.push("DB_PASSWORD");
                }
                Err(DbError::Configuration(format!(
                    "{} must be set in environment variables",
                    missing.join(" and ")
                )))
            }
        }
    }

    /// Settings for creating the pool
    pub fn pool_settings(&self) -> Result<PoolSettings, DbError> {
        Ok(PoolSettings {
            connect: self.connect_settings()?,
            min: self.pool.min,
            max: self.pool.max,
            increment: self.pool.increment,
            idle_timeout: self.pool.idle_timeout,
            queue_timeout: self.pool.queue_timeout,
        })
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            credential_bundle: self.credential_bundle.clone(),
        }
    }
}
