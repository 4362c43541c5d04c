//! Embedded SQLite driver. Backs local development and the test suite so
//! the proxy core can be exercised end to end without a Cloud backend; the
//! type bridge mirrors the Cloud mapping (INTEGER is a 64-bit type, REAL is
//! float8, TEXT is text, BLOB is bytea).

use super::{
    BackendColumn, BackendError, BackendType, BackendValue, ExecutionResult, Interrupt, SqlClient,
    SqlDriver, StatementInfo, TransactionState,
};
use crate::types::datetime;
use crate::types::numeric;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use std::sync::Arc;
use tracing::debug;

pub const SCHEME: &str = "sqlite";

pub struct SqliteDriver;

impl SqlDriver for SqliteDriver {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn connect(&self, url: &str) -> Result<Arc<dyn SqlClient>, BackendError> {
        let path = url.strip_prefix("sqlite:").unwrap_or(url);
        Ok(Arc::new(SqliteClient::open(path)?))
    }
}

pub struct SqliteClient {
    conn: Mutex<Connection>,
    interrupt: Arc<SqliteInterrupt>,
}

struct SqliteInterrupt {
    handle: InterruptHandle,
}

impl Interrupt for SqliteInterrupt {
    fn interrupt(&self) {
        self.handle.interrupt();
    }
}

impl SqliteClient {
    pub fn open(path: &str) -> Result<SqliteClient, BackendError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        // Every :memory: session gets a private database; shared-cache
        // memory databases would leak state between client sessions.
        let conn = if path == ":memory:" {
            Connection::open_with_flags("file::memory:?cache=private", flags)
        } else {
            Connection::open_with_flags(path, flags)
        }
        .map_err(map_sqlite_error)?;
        let handle = conn.get_interrupt_handle();
        Ok(SqliteClient {
            conn: Mutex::new(conn),
            interrupt: Arc::new(SqliteInterrupt { handle }),
        })
    }
}

impl SqlClient for SqliteClient {
    fn prepare(&self, sql: &str) -> Result<StatementInfo, BackendError> {
        let translated = translate_dialect(sql);
        let conn = self.conn.lock();
        let stmt = conn.prepare(&translated).map_err(map_sqlite_error)?;
        let columns = column_metadata(&stmt);
        Ok(StatementInfo {
            parameter_count: stmt.parameter_count(),
            returns_rows: !columns.is_empty(),
            columns,
        })
    }

    fn execute(
        &self,
        sql: &str,
        params: &[BackendValue],
    ) -> Result<ExecutionResult, BackendError> {
        let translated = translate_dialect(sql);
        debug!("executing: {translated}");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&translated).map_err(map_sqlite_error)?;
        let mut columns = column_metadata(&stmt);
        let bound = params.iter().map(bind_value).collect::<Vec<_>>();

        if columns.is_empty() {
            let rows_affected = stmt
                .execute(rusqlite::params_from_iter(bound))
                .map_err(map_sqlite_error)? as u64;
            return Ok(ExecutionResult {
                columns,
                rows: Vec::new(),
                rows_affected,
                returns_rows: false,
            });
        }

        let mut rows = stmt
            .query(rusqlite::params_from_iter(bound))
            .map_err(map_sqlite_error)?;
        let mut materialized: Vec<Vec<BackendValue>> = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            let mut values = Vec::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                let raw = read_value(row.get_ref(i).map_err(map_sqlite_error)?)?;
                values.push(coerce_to_column(raw, column.ty));
            }
            materialized.push(values);
        }

        // Expression columns have no declared type; fall back to the type
        // of the first non-null value observed in that column.
        for (i, column) in columns.iter_mut().enumerate() {
            if column.ty.is_none() {
                column.ty = materialized
                    .iter()
                    .find_map(|row| row[i].backend_type());
            }
        }

        Ok(ExecutionResult {
            columns,
            rows: materialized,
            rows_affected: 0,
            returns_rows: true,
        })
    }

    fn transaction_state(&self) -> TransactionState {
        if self.conn.lock().is_autocommit() {
            TransactionState::Idle
        } else {
            TransactionState::Active
        }
    }

    fn interrupt_handle(&self) -> Arc<dyn Interrupt> {
        self.interrupt.clone()
    }
}

fn column_metadata(stmt: &rusqlite::Statement<'_>) -> Vec<BackendColumn> {
    stmt.columns()
        .iter()
        .map(|column| BackendColumn {
            name: normalize_column_name(column.name()),
            ty: column.decl_type().and_then(decltype_to_backend),
        })
        .collect()
}

/// Expression columns come back named after their source text; report them
/// the way PostgreSQL names anonymous columns.
fn normalize_column_name(name: &str) -> String {
    let is_identifier = !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if is_identifier {
        name.to_string()
    } else {
        "?column?".to_string()
    }
}

fn decltype_to_backend(decl: &str) -> Option<BackendType> {
    let upper = decl.to_ascii_uppercase();
    if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
        Some(BackendType::Timestamp)
    } else if upper.contains("DATE") {
        Some(BackendType::Date)
    } else if upper.contains("BOOL") {
        Some(BackendType::Bool)
    } else if upper.contains("INT") {
        Some(BackendType::Int64)
    } else if upper.contains("NUMERIC") || upper.contains("DECIMAL") {
        Some(BackendType::Numeric)
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        Some(BackendType::Float64)
    } else if upper.contains("CHAR")
        || upper.contains("TEXT")
        || upper.contains("CLOB")
        || upper.contains("STRING")
    {
        Some(BackendType::Text)
    } else if upper.contains("BLOB") || upper.contains("BYTE") {
        Some(BackendType::Bytes)
    } else {
        None
    }
}

fn read_value(value: ValueRef<'_>) -> Result<BackendValue, BackendError> {
    Ok(match value {
        ValueRef::Null => BackendValue::Null,
        ValueRef::Integer(i) => BackendValue::Int64(i),
        ValueRef::Real(f) => BackendValue::Float64(f),
        ValueRef::Text(bytes) => BackendValue::Text(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| BackendError::new("invalid UTF-8 in stored text value"))?,
        ),
        ValueRef::Blob(bytes) => BackendValue::Bytes(bytes.to_vec()),
    })
}

/// Align a stored value with its declared column type so the wire codec
/// sees the value shape the OID promises.
fn coerce_to_column(value: BackendValue, ty: Option<BackendType>) -> BackendValue {
    match (ty, value) {
        (Some(BackendType::Bool), BackendValue::Int64(i)) => BackendValue::Bool(i != 0),
        (Some(BackendType::Numeric), BackendValue::Int64(i)) => {
            BackendValue::Numeric(rust_decimal::Decimal::from(i))
        }
        (Some(BackendType::Numeric), BackendValue::Float64(f)) => {
            use rust_decimal::prelude::FromPrimitive;
            match rust_decimal::Decimal::from_f64(f) {
                Some(d) => BackendValue::Numeric(d),
                None => BackendValue::Float64(f),
            }
        }
        (Some(BackendType::Numeric), BackendValue::Text(s)) => {
            match numeric::numeric_from_text(&s) {
                Ok(d) => BackendValue::Numeric(d),
                Err(_) => BackendValue::Text(s),
            }
        }
        (Some(BackendType::Date), BackendValue::Text(s)) => match datetime::date_from_text(&s) {
            Ok(d) => BackendValue::Date(d),
            Err(_) => BackendValue::Text(s),
        },
        (Some(BackendType::Timestamp), BackendValue::Text(s)) => {
            match datetime::timestamp_from_text(&s) {
                Ok(ts) => BackendValue::Timestamp(ts),
                Err(_) => BackendValue::Text(s),
            }
        }
        (Some(BackendType::Float64), BackendValue::Int64(i)) => BackendValue::Float64(i as f64),
        (_, value) => value,
    }
}

fn bind_value(value: &BackendValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        BackendValue::Null => Value::Null,
        BackendValue::Bool(b) => Value::Integer(*b as i64),
        BackendValue::Int64(i) => Value::Integer(*i),
        BackendValue::Float64(f) => Value::Real(*f),
        BackendValue::Numeric(d) => Value::Text(d.to_string()),
        BackendValue::Text(s) => Value::Text(s.clone()),
        BackendValue::Bytes(b) => Value::Blob(b.clone()),
        BackendValue::Date(d) => Value::Text(datetime::date_to_text(*d)),
        BackendValue::Timestamp(ts) => {
            Value::Text(format!("{}", ts.format("%Y-%m-%d %H:%M:%S%.f")))
        }
    }
}

static PARAM_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+)").unwrap());
static CAST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\?\d+|'[^']*'|\d+(?:\.\d+)?|[A-Za-z_][A-Za-z0-9_.]*)::([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap()
});
static LEFTOVER_CAST_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"::\s*[A-Za-z_][A-Za-z0-9_]*").unwrap());

/// Translate the PostgreSQL flavored statement the session hands us into
/// the embedded dialect: `$n` placeholders become `?n`, `expr::type` casts
/// become CAST expressions. Casts of expressions the pattern cannot carve
/// out are dropped; parameters are typed at bind time and result columns
/// through cast hints, so the cast has no remaining effect here.
fn translate_dialect(sql: &str) -> String {
    let sql = PARAM_PATTERN.replace_all(sql, "?$1");
    let sql = CAST_PATTERN.replace_all(&sql, |caps: &regex::Captures<'_>| {
        format!("CAST({} AS {})", &caps[1], cast_target(&caps[2]))
    });
    LEFTOVER_CAST_PATTERN.replace_all(&sql, "").into_owned()
}

fn cast_target(pg_type: &str) -> &'static str {
    match pg_type.to_ascii_lowercase().as_str() {
        "int2" | "int4" | "int8" | "smallint" | "int" | "integer" | "bigint" | "bool"
        | "boolean" => "INTEGER",
        "float4" | "float8" | "real" | "double" | "float" => "REAL",
        "bytea" => "BLOB",
        // NUMERIC affinity would push decimal strings through REAL and
        // lose exactness; the text form carries the full precision.
        _ => "TEXT",
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> BackendError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message
                .clone()
                .unwrap_or_else(|| failure.to_string());
            match failure.code {
                ErrorCode::OperationInterrupted => BackendError::interrupted("query canceled"),
                ErrorCode::ConstraintViolation => {
                    let sqlstate = if message.contains("UNIQUE") {
                        "23505"
                    } else if message.contains("FOREIGN KEY") {
                        "23503"
                    } else if message.contains("NOT NULL") {
                        "23502"
                    } else {
                        "23000"
                    };
                    BackendError::new(message).with_sqlstate(sqlstate)
                }
                _ => BackendError::new(message),
            }
        }
        rusqlite::Error::SqlInputError { msg, .. } => {
            let sqlstate = if msg.contains("no such table") {
                "42P01"
            } else if msg.contains("no such column") {
                "42703"
            } else {
                "42601"
            };
            BackendError::new(msg.clone()).with_sqlstate(sqlstate)
        }
        _ => BackendError::new(err.to_string()),
    }
}
