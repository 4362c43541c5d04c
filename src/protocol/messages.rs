use std::collections::HashMap;

/// Messages received from a PostgreSQL client.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    SslRequest,
    GssEncRequest,
    CancelRequest {
        process_id: i32,
        secret_key: i32,
    },
    StartupMessage(StartupMessage),
    Password(String),
    Query(String),
    Parse {
        name: String,
        query: String,
        param_types: Vec<i32>,
    },
    Bind {
        portal: String,
        statement: String,
        formats: Vec<i16>,
        values: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Describe {
        typ: u8, // b'S' for statement, b'P' for portal
        name: String,
    },
    Close {
        typ: u8, // b'S' for statement, b'P' for portal
        name: String,
    },
    Sync,
    Flush,
    Terminate,
    /// A recognised tag this proxy does not serve (Function call, COPY
    /// sub-protocol). The handler answers with SQLSTATE 0A000.
    Unsupported {
        tag: u8,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartupMessage {
    pub protocol_version: i32,
    pub parameters: HashMap<String, String>,
}

impl StartupMessage {
    pub fn user(&self) -> Option<&str> {
        self.parameters.get("user").map(|s| s.as_str())
    }

    pub fn database(&self) -> Option<&str> {
        self.parameters.get("database").map(|s| s.as_str())
    }
}

/// Messages sent back to a PostgreSQL client.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(AuthenticationMessage),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery { status: TransactionStatus },
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete { tag: String },
    EmptyQueryResponse,
    ErrorResponse(Box<ErrorResponse>),
    NoticeResponse(Box<ErrorResponse>),
    ParseComplete,
    BindComplete,
    CloseComplete,
    PortalSuspended,
    NoData,
    ParameterDescription(Vec<i32>),
}

#[derive(Debug, Clone)]
pub enum AuthenticationMessage {
    Ok,
    CleartextPassword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    InFailedTransaction,
}

impl TransactionStatus {
    pub fn as_byte(&self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::InFailedTransaction => b'E',
        }
    }
}

/// One column of a RowDescription message.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_id: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16, // 0 = text, 1 = binary
}

impl FieldDescription {
    pub fn new(name: String, type_oid: i32, type_size: i16, format: i16) -> Self {
        FieldDescription {
            name,
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size,
            type_modifier: -1,
            format,
        }
    }
}

/// Field set shared by ErrorResponse and NoticeResponse packets.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<i32>,
    pub where_: Option<String>,
}

impl ErrorResponse {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorResponse {
            severity: "ERROR".to_string(),
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            where_: None,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorResponse {
            severity: "FATAL".to_string(),
            ..Self::error(code, message)
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
