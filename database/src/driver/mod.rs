//! Driver boundary: the opaque asynchronous primitives the pool manager
//! is built on, plus the value types that cross it.

mod postgres;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::DriverError;

pub use postgres::PgDriver;

/// One result row, keyed by column name
pub type Row = Map<String, Value>;

/// Rows returned by a statement, always in object shape
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowSet {
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// A positional bind parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
}

impl SqlValue {
    /// Interprets a command-line literal as the narrowest matching type
    pub fn parse_literal(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("null") {
            SqlValue::Null
        } else if let Ok(v) = raw.parse::<i64>() {
            SqlValue::Int(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            SqlValue::Float(v)
        } else if let Ok(v) = raw.parse::<bool>() {
            SqlValue::Bool(v)
        } else {
            SqlValue::Text(raw.to_string())
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Per-statement execution options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Stop fetching after this many rows
    pub max_rows: Option<usize>,
}

impl ExecuteOptions {
    pub fn max_rows(limit: usize) -> Self {
        Self {
            max_rows: Some(limit),
        }
    }
}

/// Input to one-time driver client initialization
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    pub credential_bundle: Option<PathBuf>,
}

/// Transport mode chosen during client initialization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ClientMode {
    #[default]
    Plain,
    Tls {
        root_cert: PathBuf,
        /// Client certificate and key, when the bundle carries both
        client_identity: Option<(PathBuf, PathBuf)>,
    },
}

const ROOT_CERT_NAMES: [&str; 3] = ["root.crt", "ca.pem", "ca.crt"];

impl ClientMode {
    /// Resolves the credential bundle directory into a transport mode
    pub fn resolve(settings: &ClientSettings) -> Result<Self, DriverError> {
        let Some(bundle) = settings.credential_bundle.as_deref() else {
            return Ok(ClientMode::Plain);
        };

        if !bundle.is_dir() {
            return Err(DriverError::other(format!(
                "credential bundle {} is not a directory",
                bundle.display()
            )));
        }

        let root_cert = ROOT_CERT_NAMES
            .iter()
            .map(|name| bundle.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                DriverError::other(format!(
                    "credential bundle {} contains no CA certificate (expected one of {})",
                    bundle.display(),
                    ROOT_CERT_NAMES.join(", ")
                ))
            })?;

        let cert = bundle.join("client.crt");
        let key = bundle.join("client.key");
        let client_identity = (cert.is_file() && key.is_file()).then_some((cert, key));

        Ok(ClientMode::Tls {
            root_cert,
            client_identity,
        })
    }

    pub fn root_cert(&self) -> Option<&Path> {
        match self {
            ClientMode::Plain => None,
            ClientMode::Tls { root_cert, .. } => Some(root_cert),
        }
    }
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMode::Plain => write!(f, "plain"),
            ClientMode::Tls { .. } => write!(f, "tls"),
        }
    }
}

/// Credentials for one backend session
#[derive(Clone)]
pub struct ConnectSettings {
    pub connection_string: String,
    pub username: String,
    pub password: String,
    pub client_mode: ClientMode,
}

impl ConnectSettings {
    pub fn with_client_mode(mut self, client_mode: ClientMode) -> Self {
        self.client_mode = client_mode;
        self
    }
}

impl fmt::Debug for ConnectSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectSettings")
            .field("connection_string", &self.connection_string)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client_mode", &self.client_mode)
            .finish()
    }
}

/// Everything the driver needs to build a bounded pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub connect: ConnectSettings,
    pub min: u32,
    pub max: u32,
    pub increment: u32,
    pub idle_timeout: Duration,
    pub queue_timeout: Duration,
}

impl PoolSettings {
    pub fn with_client_mode(mut self, client_mode: ClientMode) -> Self {
        self.connect.client_mode = client_mode;
        self
    }
}

/// Shared handle to a live pool
pub type PoolHandle = Arc<dyn DriverPool>;

/// Database driver primitives
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// One-time client setup; repeated calls return the cached mode
    fn init_client(&self, settings: &ClientSettings) -> Result<ClientMode, DriverError>;

    /// Builds a bounded pool
    async fn create_pool(&self, settings: &PoolSettings) -> Result<PoolHandle, DriverError>;

    /// Opens a single connection outside of any pool
    async fn connect_direct(
        &self,
        settings: &ConnectSettings,
    ) -> Result<Box<dyn DriverConnection>, DriverError>;
}

/// A bounded set of backend connections
#[async_trait]
pub trait DriverPool: Send + Sync + 'static {
    /// Leases one connection, waiting at most the queue timeout
    async fn acquire(&self) -> Result<Box<dyn DriverConnection>, DriverError>;

    /// Closes the pool, letting leased connections drain for `drain`
    async fn close(&self, drain: Duration) -> Result<(), DriverError>;
}

/// One backend session
#[async_trait]
pub trait DriverConnection: Send + 'static {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &ExecuteOptions,
    ) -> Result<RowSet, DriverError>;

    /// Returns the session to its pool, or closes it when unpooled
    async fn release(self: Box<Self>) -> Result<(), DriverError>;

    /// Closes the session outright, never returning it to a pool
    async fn discard(self: Box<Self>) -> Result<(), DriverError>;
}
