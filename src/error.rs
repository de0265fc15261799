//! Error types for anysql.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Errors are `Clone` because one execution failure is delivered to several
//! consumers: the failing statement's cursor, the connection's error callback,
//! and the connection's stored pause state.

use crate::models::QueryParam;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Statement failed: {cause} (sql: {sql}{})", params_suffix(.params))]
    Statement {
        sql: String,
        params: Vec<QueryParam>,
        #[source]
        cause: Box<DbError>,
    },

    #[error("{}", released_message(.broken))]
    Released {
        /// True if the connection failed before it was released.
        broken: bool,
    },

    #[error("Statement discarded before execution")]
    Discarded,

    #[error("Usage error: {message}")]
    Usage { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Driver not found: {name}")]
    DriverNotFound { name: String },

    #[error("Driver already registered: {name}")]
    DriverAlreadyRegistered { name: String },
}

fn released_message(broken: &bool) -> &'static str {
    if *broken {
        "Connection is broken due to an earlier error and has been released"
    } else {
        "Connection has been released and is no longer available"
    }
}

/// Parameters shown in a statement error. Long values are cut short.
const SHOWN_PARAMS: usize = 4;
const SHOWN_TEXT: usize = 24;

fn params_suffix(params: &[QueryParam]) -> String {
    if params.is_empty() {
        return String::new();
    }
    let mut shown: Vec<String> = params.iter().take(SHOWN_PARAMS).map(short_param).collect();
    if params.len() > SHOWN_PARAMS {
        shown.push(format!("+{} more", params.len() - SHOWN_PARAMS));
    }
    format!(", params: [{}]", shown.join(", "))
}

fn short_param(param: &QueryParam) -> String {
    let text = match param {
        QueryParam::Null => return "NULL".to_string(),
        QueryParam::Bool(v) => return v.to_string(),
        QueryParam::Int(v) => return v.to_string(),
        QueryParam::Float(v) => return v.to_string(),
        QueryParam::Bytes(v) => return format!("<{} bytes>", v.len()),
        QueryParam::String(v) => format!("'{v}'"),
        QueryParam::Json(v) => v.to_string(),
    };
    if text.chars().count() > SHOWN_TEXT {
        let cut: String = text.chars().take(SHOWN_TEXT).collect();
        format!("{cut}...")
    } else {
        text
    }
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Wrap a driver error with the statement that produced it.
    pub fn statement(sql: impl Into<String>, params: &[QueryParam], cause: DbError) -> Self {
        Self::Statement {
            sql: sql.into(),
            params: params.to_vec(),
            cause: Box::new(cause),
        }
    }

    pub fn released(broken: bool) -> Self {
        Self::Released { broken }
    }

    /// Create a usage error (wrong call sequence on a connection or cursor).
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn driver_not_found(name: impl Into<String>) -> Self {
        Self::DriverNotFound { name: name.into() }
    }

    pub fn driver_already_registered(name: impl Into<String>) -> Self {
        Self::DriverAlreadyRegistered { name: name.into() }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::Statement { cause, .. } => cause.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error was raised synchronously for a misuse of the API.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage { .. } | Self::Released { .. })
    }

    /// The driver-level error underneath any statement context.
    pub fn root_cause(&self) -> &DbError {
        match self {
            Self::Statement { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
