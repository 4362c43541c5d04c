use crate::backend::{SqlClient, TransactionState};
use crate::protocol::TransactionStatus;
use crate::statements::{Portal, PreparedStatement};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

pub struct SessionState {
    pub id: uuid::Uuid,
    pub database: String,
    pub user: String,
    pub parameters: RwLock<HashMap<String, String>>,
    pub prepared_statements: RwLock<HashMap<String, PreparedStatement>>,
    pub portals: RwLock<HashMap<String, Portal>>,
    /// Set when a statement fails inside an open backend transaction;
    /// cleared once the backend leaves the transaction.
    transaction_failed: AtomicBool,
}

impl SessionState {
    pub fn new(database: String, user: String) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("server_version".to_string(), "13.4".to_string());
        parameters.insert("server_encoding".to_string(), "UTF8".to_string());
        parameters.insert("client_encoding".to_string(), "UTF8".to_string());
        parameters.insert("DateStyle".to_string(), "ISO, MDY".to_string());
        parameters.insert("IntervalStyle".to_string(), "iso_8601".to_string());
        parameters.insert("TimeZone".to_string(), "UTC".to_string());
        parameters.insert("integer_datetimes".to_string(), "on".to_string());

        SessionState {
            id: uuid::Uuid::new_v4(),
            database,
            user,
            parameters: RwLock::new(parameters),
            prepared_statements: RwLock::new(HashMap::new()),
            portals: RwLock::new(HashMap::new()),
            transaction_failed: AtomicBool::new(false),
        }
    }

    pub fn mark_transaction_failed(&self) {
        self.transaction_failed.store(true, Ordering::SeqCst);
    }

    /// The ReadyForQuery status byte. The open/closed half comes from the
    /// backend; the failed flag is session-local and resets once the
    /// backend reports the transaction is gone.
    pub fn transaction_status(&self, client: &dyn SqlClient) -> TransactionStatus {
        match client.transaction_state() {
            TransactionState::Active => {
                if self.transaction_failed.load(Ordering::SeqCst) {
                    TransactionStatus::InFailedTransaction
                } else {
                    TransactionStatus::InTransaction
                }
            }
            TransactionState::Idle => {
                self.transaction_failed.store(false, Ordering::SeqCst);
                TransactionStatus::Idle
            }
        }
    }

    /// Record an execution error: only errors inside an open transaction
    /// poison it.
    pub fn record_error(&self, client: &dyn SqlClient) {
        if client.transaction_state() == TransactionState::Active {
            self.mark_transaction_failed();
        }
    }

    /// Remove a prepared statement along with every portal bound to it; a
    /// portal must never outlive its statement.
    pub async fn close_statement(&self, name: &str) {
        let removed = self.prepared_statements.write().await.remove(name);
        if removed.is_some() {
            self.portals
                .write()
                .await
                .retain(|_, portal| portal.statement_name != name);
        }
    }

    pub async fn close_portal(&self, name: &str) {
        self.portals.write().await.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sqlite::SqliteClient;
    use crate::backend::{BackendValue, StatementInfo};
    use crate::statements::PortalState;

    fn statement(sql: &str) -> PreparedStatement {
        PreparedStatement {
            sql: sql.to_string(),
            translated_sql: sql.to_string(),
            param_types: vec![],
            info: StatementInfo {
                columns: vec![],
                parameter_count: 0,
                returns_rows: false,
            },
            result_hints: vec![],
        }
    }

    #[tokio::test]
    async fn closing_statement_closes_dependent_portals() {
        let session = SessionState::new("db".to_string(), "user".to_string());
        session
            .prepared_statements
            .write()
            .await
            .insert("s1".to_string(), statement("SELECT 1"));
        session.portals.write().await.insert(
            "p1".to_string(),
            Portal {
                statement_name: "s1".to_string(),
                params: Vec::<BackendValue>::new(),
                result_formats: vec![],
                state: PortalState::Pending,
            },
        );

        session.close_statement("s1").await;
        assert!(session.prepared_statements.read().await.is_empty());
        assert!(session.portals.read().await.is_empty());
    }

    #[tokio::test]
    async fn failed_flag_resets_outside_transaction() {
        let session = SessionState::new("db".to_string(), "user".to_string());
        let client = SqliteClient::open(":memory:").unwrap();

        client.execute("BEGIN", &[]).unwrap();
        session.record_error(&client);
        assert_eq!(
            session.transaction_status(&client),
            TransactionStatus::InFailedTransaction
        );
        client.execute("ROLLBACK", &[]).unwrap();
        assert_eq!(
            session.transaction_status(&client),
            TransactionStatus::Idle
        );
        client.execute("BEGIN", &[]).unwrap();
        assert_eq!(
            session.transaction_status(&client),
            TransactionStatus::InTransaction
        );
    }
}
