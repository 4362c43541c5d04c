//! The backend "SQL client" capability. The proxy core is written against
//! the [`SqlClient`] trait; concrete drivers mount themselves in the
//! process-wide registry keyed by connection-URL scheme, the way JDBC
//! drivers register with DriverManager. In-tree only the embedded `sqlite:`
//! driver is provided; Cloud drivers are external collaborators.

pub mod sqlite;

use crate::types::PgType;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A value travelling between the wire codec and the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl BackendValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BackendValue::Null)
    }

    /// The natural column type of this value, used when the backend cannot
    /// type a result column ahead of execution.
    pub fn backend_type(&self) -> Option<BackendType> {
        match self {
            BackendValue::Null => None,
            BackendValue::Bool(_) => Some(BackendType::Bool),
            BackendValue::Int64(_) => Some(BackendType::Int64),
            BackendValue::Float64(_) => Some(BackendType::Float64),
            BackendValue::Numeric(_) => Some(BackendType::Numeric),
            BackendValue::Text(_) => Some(BackendType::Text),
            BackendValue::Bytes(_) => Some(BackendType::Bytes),
            BackendValue::Date(_) => Some(BackendType::Date),
            BackendValue::Timestamp(_) => Some(BackendType::Timestamp),
        }
    }
}

/// Backend column types. This enum is the single source of truth for the
/// wire OID a backend column is reported under, and thereby for the codec
/// path its values take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Bool,
    Int64,
    Float64,
    Numeric,
    Text,
    Bytes,
    Date,
    Timestamp,
}

impl BackendType {
    pub fn pg_type(self) -> PgType {
        match self {
            BackendType::Bool => PgType::Bool,
            BackendType::Int64 => PgType::Int8,
            BackendType::Float64 => PgType::Float8,
            BackendType::Numeric => PgType::Numeric,
            BackendType::Text => PgType::Text,
            BackendType::Bytes => PgType::Bytea,
            BackendType::Date => PgType::Date,
            BackendType::Timestamp => PgType::Timestamptz,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendColumn {
    pub name: String,
    /// None when the backend cannot type the column before execution
    /// (expression columns); the session falls back to value typing or
    /// cast hints.
    pub ty: Option<BackendType>,
}

/// Prepared-statement metadata, produced without executing.
#[derive(Debug, Clone)]
pub struct StatementInfo {
    pub columns: Vec<BackendColumn>,
    pub parameter_count: usize,
    pub returns_rows: bool,
}

/// A fully materialised execution result. Row delivery to the client is
/// pull-based out of the portal cursor, so suspension under `Execute`
/// row limits needs the rows retained anyway.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub columns: Vec<BackendColumn>,
    pub rows: Vec<Vec<BackendValue>>,
    pub rows_affected: u64,
    pub returns_rows: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Active,
}

#[derive(Debug)]
pub struct BackendError {
    pub message: String,
    /// SQLSTATE supplied by the backend, passed through to the client when
    /// present; 42000 otherwise.
    pub sqlstate: Option<String>,
    /// Set when the statement was interrupted by a cancel request; surfaces
    /// as SQLSTATE 57014.
    pub interrupted: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError {
            message: message.into(),
            sqlstate: None,
            interrupted: false,
        }
    }

    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        BackendError {
            message: message.into(),
            sqlstate: Some("57014".to_string()),
            interrupted: true,
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}

/// Interrupts a backend call in flight on another task.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// One backend session. One instance per client session; never shared.
pub trait SqlClient: Send + Sync {
    /// Statement metadata without execution, for Describe.
    fn prepare(&self, sql: &str) -> Result<StatementInfo, BackendError>;

    /// Execute with bound parameters, materialising the result.
    fn execute(&self, sql: &str, params: &[BackendValue])
        -> Result<ExecutionResult, BackendError>;

    /// Whether the backend currently holds an open transaction. Read after
    /// every statement for the ReadyForQuery status byte.
    fn transaction_state(&self) -> TransactionState;

    /// Handle used by cancel routing and shutdown.
    fn interrupt_handle(&self) -> Arc<dyn Interrupt>;
}

/// Opens a backend session from a connection URL.
pub trait SqlDriver: Send + Sync {
    fn scheme(&self) -> &str;
    fn connect(&self, url: &str) -> Result<Arc<dyn SqlClient>, BackendError>;
}

static DRIVERS: Lazy<Mutex<HashMap<String, Arc<dyn SqlDriver>>>> = Lazy::new(|| {
    let mut drivers: HashMap<String, Arc<dyn SqlDriver>> = HashMap::new();
    drivers.insert(
        sqlite::SCHEME.to_string(),
        Arc::new(sqlite::SqliteDriver) as Arc<dyn SqlDriver>,
    );
    Mutex::new(drivers)
});

/// Register a driver for a URL scheme. External backend drivers call this
/// before the server starts accepting connections.
pub fn register_driver(driver: Arc<dyn SqlDriver>) {
    DRIVERS
        .lock()
        .insert(driver.scheme().to_string(), driver);
}

/// Open a backend session for the given connection URL.
pub fn connect(url: &str) -> Result<Arc<dyn SqlClient>, BackendError> {
    let scheme = url
        .split(':')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BackendError::new(format!("malformed connection URL: {url}")))?;

    let driver = DRIVERS.lock().get(scheme).cloned();

    match driver {
        Some(driver) => driver.connect(url),
        None => Err(BackendError::new(format!(
            "no SQL driver registered for scheme \"{scheme}\""
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_types_map_to_wire_oids() {
        assert_eq!(BackendType::Int64.pg_type(), PgType::Int8);
        assert_eq!(BackendType::Numeric.pg_type(), PgType::Numeric);
        assert_eq!(BackendType::Float64.pg_type(), PgType::Float8);
        assert_eq!(BackendType::Bool.pg_type(), PgType::Bool);
        assert_eq!(BackendType::Text.pg_type(), PgType::Text);
        assert_eq!(BackendType::Bytes.pg_type(), PgType::Bytea);
        assert_eq!(BackendType::Date.pg_type(), PgType::Date);
        assert_eq!(BackendType::Timestamp.pg_type(), PgType::Timestamptz);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = match connect("cloudspanner:/projects/p/instances/i/databases/d") {
            Err(e) => e,
            Ok(_) => panic!("expected connect to fail"),
        };
        assert!(err.message.contains("no SQL driver"));
    }

    #[test]
    fn sqlite_scheme_connects() {
        let client = connect("sqlite::memory:").unwrap();
        assert_eq!(client.transaction_state(), TransactionState::Idle);
    }
}
