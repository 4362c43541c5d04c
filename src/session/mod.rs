// Session management: per-connection state and the connection handler
// state machine.
pub mod handler;
pub mod state;

pub use handler::handle_connection;
pub use state::SessionState;

use crate::backend::SqlClient;
use crate::config::Config;
use crate::translator::QueryTranslator;
use crate::types::value_codec::Format;
use std::sync::Arc;

/// Everything a query handler needs from its session.
pub struct QueryContext {
    pub session: Arc<SessionState>,
    pub client: Arc<dyn SqlClient>,
    pub translator: Arc<QueryTranslator>,
    pub config: Arc<Config>,
}

impl QueryContext {
    /// Result format for columns the client did not pick one for. The
    /// force-binary option only covers the extended protocol.
    pub fn default_result_format(&self) -> Format {
        if self.config.force_binary {
            Format::Binary
        } else {
            Format::Text
        }
    }
}
