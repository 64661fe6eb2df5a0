//! Error types for the data-access layer.
//!
//! This module defines all error types using `thiserror`. Phase errors
//! (`BeginFailed`, `CommitFailed`, ...) wrap their cause so the full chain is
//! available through [`std::error::Error::source`], outermost first.

use thiserror::Error;

/// Boxed error accepted from caller-supplied unit-of-work bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Statement phase reported alongside a failed named query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Exec,
    Query,
    QueryRow,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::Query => write!(f, "query"),
            Self::QueryRow => write!(f, "query row"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to connect to db: {message}")]
    ConnectFailed { message: String, suggestion: String },

    #[error("ping failed")]
    PingFailed {
        #[source]
        source: Box<DbError>,
    },

    #[error("can't begin transaction")]
    BeginFailed {
        #[source]
        source: Box<DbError>,
    },

    #[error("failed to execute code inside transaction")]
    BodyFailed {
        #[source]
        source: BoxError,
    },

    #[error("{cause}; rollback failed: {rollback}")]
    RollbackFailed {
        #[source]
        cause: Box<DbError>,
        rollback: Box<DbError>,
    },

    #[error("tx commit failed")]
    CommitFailed {
        #[source]
        source: Box<DbError>,
    },

    #[error("panic recovered: {message}")]
    PanicRecovered { message: String },

    #[error("Invalid transaction state: {message} (transaction: {transaction_id})")]
    InvalidTransactionState {
        message: String,
        transaction_id: String,
    },

    #[error("sql {name}: {phase} failed")]
    Statement {
        name: String,
        phase: Phase,
        #[source]
        source: Box<DbError>,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("sql {query}: scan failed: {message}")]
    ScanFailed { query: String, message: String },

    #[error("sql {query}: no rows in result set")]
    NotFound { query: String },

    #[error("sql {query}: expected one row, got {count}")]
    MultipleRows { query: String, count: usize },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    /// No pooled connection became free within the pool's acquire timeout.
    #[error("Timeout: connection pool acquire timed out")]
    PoolTimedOut,

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connect(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConnectFailed {
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

    pub fn ping(source: DbError) -> Self {
        Self::PingFailed {
            source: Box::new(source),
        }
    }

    pub fn begin(source: DbError) -> Self {
        Self::BeginFailed {
            source: Box::new(source),
        }
    }

    pub fn body(source: impl Into<BoxError>) -> Self {
        Self::BodyFailed {
            source: source.into(),
        }
    }

    /// Combine the failure that triggered a rollback with the rollback's own failure.
    pub fn rollback(cause: DbError, rollback: DbError) -> Self {
        Self::RollbackFailed {
            cause: Box::new(cause),
            rollback: Box::new(rollback),
        }
    }

    pub fn commit(source: DbError) -> Self {
        Self::CommitFailed {
            source: Box::new(source),
        }
    }

    pub fn panic_recovered(message: impl Into<String>) -> Self {
        Self::PanicRecovered {
            message: message.into(),
        }
    }

    /// Create an invalid transaction state error.
    pub fn invalid_transaction_state(
        message: impl Into<String>,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self::InvalidTransactionState {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Annotate a statement failure with the named query and phase.
    pub fn statement(name: impl Into<String>, phase: Phase, source: DbError) -> Self {
        Self::Statement {
            name: name.into(),
            phase,
            source: Box::new(source),
        }
    }

    pub fn scan_failed(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScanFailed {
            query: query.into(),
            message: message.into(),
        }
    }

    pub fn not_found(query: impl Into<String>) -> Self {
        Self::NotFound {
            query: query.into(),
        }
    }

    pub fn multiple_rows(query: impl Into<String>, count: usize) -> Self {
        Self::MultipleRows {
            query: query.into(),
            count,
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

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectFailed { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => self.wrapped().and_then(DbError::suggestion),
        }
    }

    /// Check if this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } | Self::Timeout { .. } | Self::PoolTimedOut => true,
            Self::PingFailed { source } | Self::Statement { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// True for cancellation or deadline expiry anywhere in the chain.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::Cancelled | Self::DeadlineExceeded
        )
    }

    /// The deepest `DbError` in the wrapping chain.
    ///
    /// Follows `source` through every wrapper, including a caller's
    /// `DbError` boxed inside `BodyFailed`. For `RollbackFailed` this is the
    /// root of the original cause, not of the rollback failure.
    pub fn root_cause(&self) -> &DbError {
        let mut current = self;
        while let Some(next) = current.wrapped() {
            current = next;
        }
        current
    }

    fn wrapped(&self) -> Option<&DbError> {
        match self {
            Self::PingFailed { source }
            | Self::BeginFailed { source }
            | Self::CommitFailed { source }
            | Self::Statement { source, .. } => Some(source),
            Self::RollbackFailed { cause, .. } => Some(cause),
            Self::BodyFailed { source } => source.downcast_ref::<DbError>(),
            _ => None,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connect(
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
            sqlx::Error::PoolTimedOut => DbError::PoolTimedOut,
            sqlx::Error::PoolClosed => {
                DbError::connect("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connect(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connect(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connect(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
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
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Render `err` and every `source` below it as `outer: inner: ...`.
///
/// `DbError` wrappers only display their own step, so logs use this to keep
/// the underlying failure visible.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        text.push_str(": ");
        text.push_str(&source.to_string());
        current = source.source();
    }
    text
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
