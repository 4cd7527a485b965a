//! Error types for the statement mapper.
//!
//! This module defines all error types using `thiserror`. Load-time failures
//! (`Config`, `StatementLoad`) surface from `initialize`; everything else is a
//! per-call failure returned to the immediate caller. "No rows" is never an
//! error.

use thiserror::Error;

/// Failures produced while turning a statement plus parameters into a bound query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("missing parameter ':{name}' for statement '{statement}'")]
    MissingParameter { statement: String, name: String },

    #[error("missing positional value %{index} for statement '{statement}'")]
    MissingPositional { statement: String, index: usize },

    #[error("rejected value for %{index} in statement '{statement}': {reason}")]
    InvalidSubstitution {
        statement: String,
        index: usize,
        reason: String,
    },

    #[error("parameter ':{name}' of statement '{statement}' is an empty list")]
    EmptyList { statement: String, name: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Statement load error in '{source_name}': {message}")]
    StatementLoad {
        source_name: String,
        message: String,
    },

    #[error("Statement not found: {statement}")]
    StatementNotFound { statement: String },

    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    #[error("Connection pool exhausted: no connection available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Connection broken: {message}")]
    ConnectionBroken { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction error: {message} (unit: {unit_id})")]
    Transaction { message: String, unit_id: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Engine not initialized")]
    EngineNotInitialized,

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a statement load error for the named template source.
    pub fn statement_load(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StatementLoad {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a statement not found error.
    pub fn statement_not_found(statement: impl Into<String>) -> Self {
        Self::StatementNotFound {
            statement: statement.into(),
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(waited_ms: u64) -> Self {
        Self::PoolExhausted { waited_ms }
    }

    /// Create a broken connection error with a helpful suggestion.
    pub fn connection_broken(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConnectionBroken {
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

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, unit_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            unit_id: unit_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
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

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionBroken { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Increase max_connection_count or max_wait_time, or release leases sooner")
            }
            Self::EngineNotInitialized => Some("Call initialize() before issuing statements"),
            _ => None,
        }
    }

    /// Check if this error is a load-time failure that prevents initialization.
    pub fn is_load_error(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::StatementLoad { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL template and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::internal("Driver reported no rows"),
            sqlx::Error::PoolTimedOut => DbError::pool_exhausted(0),
            sqlx::Error::PoolClosed => DbError::EngineNotInitialized,
            sqlx::Error::Io(io_err) => DbError::connection_broken(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection_broken(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection_broken(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::internal(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection_broken(
                "Database worker crashed",
                "The connection will be replaced on next acquire",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for engine operations.
pub type DbResult<T> = Result<T, DbError>;
