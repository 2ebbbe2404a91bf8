// PostgreSQL driver backed by sqlx

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow, PgSslMode,
};
use sqlx::query::Query;
use sqlx::{Column, Connection, Postgres, Row as _, TypeInfo};
use tracing::{debug, info};

use super::{
    ClientMode, ClientSettings, ConnectSettings, Driver, DriverConnection, DriverPool,
    ExecuteOptions, PoolHandle, PoolSettings, Row, RowSet, SqlValue,
};
use crate::error::{DriverError, DriverErrorKind};

const APPLICATION_NAME: &str = "kpi-dashboard";

/// Driver for the Postgres analytics warehouse
#[derive(Default)]
pub struct PgDriver {
    client_mode: Mutex<Option<ClientMode>>,
}

impl PgDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for PgDriver {
    fn init_client(&self, settings: &ClientSettings) -> Result<ClientMode, DriverError> {
        let mut cached = self.client_mode.lock();
        if let Some(mode) = cached.as_ref() {
            return Ok(mode.clone());
        }

        let mode = ClientMode::resolve(settings)?;
        match &mode {
            ClientMode::Plain => info!("Database client initialized (plain transport)"),
            ClientMode::Tls { root_cert, .. } => info!(
                root_cert = %root_cert.display(),
                "Database client initialized (tls transport)"
            ),
        }
        *cached = Some(mode.clone());
        Ok(mode)
    }

    async fn create_pool(&self, settings: &PoolSettings) -> Result<PoolHandle, DriverError> {
        let options = connect_options(&settings.connect)?;

        // sqlx opens connections on demand one at a time, so the increment is advisory
        debug!(increment = settings.increment, "Building sqlx pool");

        let pool = PgPoolOptions::new()
            .min_connections(settings.min)
            .max_connections(settings.max)
            .acquire_timeout(settings.queue_timeout)
            .idle_timeout(settings.idle_timeout)
            // The pool manager validates every lease itself
            .test_before_acquire(false)
            .connect_with(options)
            .await
            .map_err(pool_creation_error)?;

        Ok(Arc::new(PgPoolHandle { pool }))
    }

    async fn connect_direct(
        &self,
        settings: &ConnectSettings,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        let options = connect_options(settings)?;
        let conn = PgConnection::connect_with(&options).await?;
        Ok(Box::new(PgSession::Direct(conn)))
    }
}

struct PgPoolHandle {
    pool: PgPool,
}

#[async_trait]
impl DriverPool for PgPoolHandle {
    async fn acquire(&self) -> Result<Box<dyn DriverConnection>, DriverError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession::Pooled(conn)))
    }

    async fn close(&self, drain: Duration) -> Result<(), DriverError> {
        tokio::time::timeout(drain, self.pool.close())
            .await
            .map_err(|_| DriverError::other(format!("pool did not drain within {:?}", drain)))
    }
}

enum PgSession {
    Pooled(PoolConnection<Postgres>),
    Direct(PgConnection),
}

impl PgSession {
    fn connection(&mut self) -> &mut PgConnection {
        match self {
            PgSession::Pooled(conn) => &mut **conn,
            PgSession::Direct(conn) => conn,
        }
    }
}

#[async_trait]
impl DriverConnection for PgSession {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &ExecuteOptions,
    ) -> Result<RowSet, DriverError> {
        let query = bind_params(sql, params);
        let conn = self.connection();

        let rows: Vec<PgRow> = match options.max_rows {
            Some(limit) => query.fetch(conn).take(limit).try_collect().await?,
            None => query.fetch_all(conn).await?,
        };

        Ok(RowSet::new(rows.iter().map(row_to_json).collect()))
    }

    async fn release(self: Box<Self>) -> Result<(), DriverError> {
        match *self {
            // Dropping a pool connection hands it back to the pool
            PgSession::Pooled(conn) => {
                drop(conn);
                Ok(())
            }
            PgSession::Direct(conn) => conn.close().await.map_err(Into::into),
        }
    }

    async fn discard(self: Box<Self>) -> Result<(), DriverError> {
        match *self {
            PgSession::Pooled(conn) => conn.detach().close().await.map_err(Into::into),
            PgSession::Direct(conn) => conn.close().await.map_err(Into::into),
        }
    }
}

fn bind_params<'q>(sql: &'q str, params: &[SqlValue]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| match param {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Json(v) => query.bind(sqlx::types::Json(v.clone())),
        })
}

fn row_to_json(row: &PgRow) -> Row {
    let mut map = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name());
        map.insert(column.name().to_string(), value);
    }
    map
}

fn get<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

fn float(v: f64) -> Option<Value> {
    Number::from_f64(v).map(Value::Number)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Value {
    let value = match type_name {
        "BOOL" => get::<bool>(row, idx).map(Value::Bool),
        "INT2" => get::<i16>(row, idx).map(Value::from),
        "INT4" => get::<i32>(row, idx).map(Value::from),
        "INT8" => get::<i64>(row, idx).map(Value::from),
        "FLOAT4" => get::<f32>(row, idx).and_then(|v| float(v as f64)),
        "FLOAT8" => get::<f64>(row, idx).and_then(float),
        "NUMERIC" => get::<Decimal>(row, idx)
            .and_then(|v| v.to_f64())
            .and_then(float),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => get::<String>(row, idx).map(Value::String),
        "JSON" | "JSONB" => get::<Value>(row, idx),
        "UUID" => get::<uuid::Uuid>(row, idx).map(|v| Value::String(v.to_string())),
        "DATE" => get::<chrono::NaiveDate>(row, idx).map(|v| Value::String(v.to_string())),
        "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, idx)
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "TIMESTAMPTZ" => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|v| Value::String(v.to_rfc3339())),
        other => {
            debug!(column_type = other, "Unsupported column type decoded as null");
            None
        }
    };
    value.unwrap_or(Value::Null)
}

/// Host, port and database parsed from a `host[:port][/database]` string
#[derive(Debug, PartialEq, Eq)]
struct ConnectTarget {
    host: String,
    port: Option<u16>,
    database: Option<String>,
}

impl ConnectTarget {
    fn parse(raw: &str) -> Result<Self, DriverError> {
        let (authority, database) = match raw.split_once('/') {
            Some((authority, db)) => (authority, Some(db).filter(|db| !db.is_empty())),
            None => (raw, None),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    DriverError::other(format!("invalid port '{}' in connection string", port))
                })?;
                (host, Some(port))
            }
            None => (authority, None),
        };

        if host.is_empty() {
            return Err(DriverError::other(format!(
                "connection string '{}' has no host",
                raw
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            database: database.map(str::to_string),
        })
    }
}

fn connect_options(settings: &ConnectSettings) -> Result<PgConnectOptions, DriverError> {
    let raw = settings.connection_string.trim();
    let mut options = if raw.starts_with("postgres://") || raw.starts_with("postgresql://") {
        PgConnectOptions::from_str(raw)?
    } else {
        let target = ConnectTarget::parse(raw)?;
        let mut options = PgConnectOptions::new().host(&target.host);
        if let Some(port) = target.port {
            options = options.port(port);
        }
        if let Some(database) = &target.database {
            options = options.database(database);
        }
        options
    };

    options = options
        .username(&settings.username)
        .password(&settings.password)
        .application_name(APPLICATION_NAME);

    if let ClientMode::Tls {
        root_cert,
        client_identity,
    } = &settings.client_mode
    {
        options = options.ssl_mode(PgSslMode::VerifyFull).ssl_root_cert(root_cert);
        if let Some((cert, key)) = client_identity {
            options = options.ssl_client_cert(cert).ssl_client_key(key);
        }
    }

    Ok(options)
}

/// `connect_with` retries refused connections until the acquire timeout and
/// then reports `PoolTimedOut`; at creation that means the backend is
/// unreachable, not that the pool is exhausted.
fn pool_creation_error(err: sqlx::Error) -> DriverError {
    match err {
        sqlx::Error::PoolTimedOut => DriverError::broken_session(
            "could not open the first pool connection before the timeout: backend unreachable",
        ),
        other => other.into(),
    }
}

// SQLSTATE class 08 (connection exception) and server shutdown codes
fn is_broken_session_code(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

fn mentions_broken_session(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "end-of-file",
        "end of file",
        "unexpected eof",
        "connection reset",
        "broken pipe",
        "connection closed",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => DriverError::acquire_timeout(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DriverError::broken_session(err.to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned());
                let kind = match code.as_deref() {
                    Some(code) if is_broken_session_code(code) => DriverErrorKind::BrokenSession,
                    _ if mentions_broken_session(db.message()) => DriverErrorKind::BrokenSession,
                    _ => DriverErrorKind::Other,
                };
                let driver_err = DriverError::new(kind, db.message());
                match code {
                    Some(code) => driver_err.with_code(code),
                    None => driver_err,
                }
            }
            _ => {
                let message = err.to_string();
                if mentions_broken_session(&message) {
                    DriverError::broken_session(message)
                } else {
                    DriverError::other(message)
                }
            }
        }
    }
}
