// PostgreSQL wire protocol: typed messages and the framing codec.
pub mod codec;
pub mod messages;

pub use codec::{
    PostgresCodec, CANCEL_REQUEST_CODE, GSS_ENC_REQUEST_CODE, PROTOCOL_VERSION_3, SSL_REQUEST_CODE,
};
pub use messages::*;
