//! Mapping from internal errors to wire `ErrorResponse` packets.

use crate::protocol::messages::ErrorResponse;
use crate::PgBridgeError;

/// SQLSTATE sent to every live session on server shutdown.
pub const ADMIN_SHUTDOWN: &str = "57P01";

impl PgBridgeError {
    pub fn to_error_response(&self) -> ErrorResponse {
        let code = self.pg_error_code().to_string();
        let message = match self {
            PgBridgeError::Backend(err) => err.message.clone(),
            other => other.to_string(),
        };
        if self.is_fatal() {
            ErrorResponse::fatal(code, message)
        } else {
            ErrorResponse::error(code, message)
        }
    }
}

pub fn admin_shutdown_response() -> ErrorResponse {
    ErrorResponse::fatal(
        ADMIN_SHUTDOWN,
        "terminating connection due to administrator command",
    )
}
