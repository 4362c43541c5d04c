pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod protocol;
pub mod query;
pub mod server;
pub mod session;
pub mod statements;
pub mod translator;
pub mod types;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PgBridgeError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("{0}")]
    Backend(#[from] backend::BackendError),

    #[error("invalid text representation: {0}")]
    TextCodec(String),

    #[error("invalid binary representation: {0}")]
    BinaryCodec(String),

    #[error("invalid byte sequence for encoding \"UTF8\"")]
    InvalidUtf8,

    #[error("translation failed: {0}")]
    Translator(String),

    #[error("feature not supported: {0}")]
    NotSupported(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("query canceled")]
    QueryCanceled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PgBridgeError>;

impl PgBridgeError {
    /// The SQLSTATE reported to the client for this error.
    pub fn pg_error_code(&self) -> &str {
        match self {
            PgBridgeError::Protocol(_) => "08P01",
            PgBridgeError::AuthenticationFailed => "28P01",
            PgBridgeError::Backend(err) => {
                if err.interrupted {
                    "57014"
                } else {
                    err.sqlstate.as_deref().unwrap_or("42000")
                }
            }
            PgBridgeError::TextCodec(_) => "22P02",
            PgBridgeError::BinaryCodec(_) => "22P03",
            PgBridgeError::InvalidUtf8 => "22021",
            PgBridgeError::Translator(_) => "XX000",
            PgBridgeError::NotSupported(_) => "0A000",
            PgBridgeError::InvalidParameter(_) => "22023",
            PgBridgeError::QueryCanceled => "57014",
            PgBridgeError::Io(_) => "58030",
        }
    }

    /// Errors that end the session after the response is written.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgBridgeError::AuthenticationFailed | PgBridgeError::Io(_)
        )
    }
}
