//! Error types for the audit crate
//!
//! Two families live here. [`Error`] is what public operations return: config
//! loading, store access, unit-of-work misuse. [`CaptureError`] is internal to
//! the change-capture pipeline and never crosses the engine boundary; it is
//! converted into a [`FlushDiagnostic`](crate::audit::FlushDiagnostic) instead.

use std::fmt;
use thiserror::Error;

// ============================================================================
// Structured Database Errors
// ============================================================================

/// Database operation being performed when the error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseOperation {
    /// Establishing a database connection
    Connect,
    /// Executing a query
    Query,
    /// Inserting or upserting records
    Insert,
    /// Deleting records
    Delete,
    /// Transaction operations (begin, commit, rollback)
    Transaction,
    /// Creating tables, indexes and triggers
    Migration,
}

impl fmt::Display for DatabaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Query => write!(f, "query"),
            Self::Insert => write!(f, "insert"),
            Self::Delete => write!(f, "delete"),
            Self::Transaction => write!(f, "transaction"),
            Self::Migration => write!(f, "migration"),
        }
    }
}

/// Category of database error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseErrorKind {
    /// Failed to establish connection
    ConnectionFailed,
    /// Query execution failed
    QueryFailed,
    /// Transaction failed (begin, commit, or rollback)
    TransactionFailed,
    /// Constraint violation (unique, trigger abort, check)
    ConstraintViolation,
    /// Type conversion error while reading a row
    TypeConversion,
    /// Other/unknown error
    Other,
}

impl fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::QueryFailed => write!(f, "query_failed"),
            Self::TransactionFailed => write!(f, "transaction_failed"),
            Self::ConstraintViolation => write!(f, "constraint_violation"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured database error with operation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseError {
    /// The operation being performed when the error occurred
    pub operation: DatabaseOperation,
    /// The category of error
    pub kind: DatabaseErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Additional context (e.g., table name, query fragment)
    pub context: Option<String>,
}

impl DatabaseError {
    /// Create a new database error
    pub fn new(
        operation: DatabaseOperation,
        kind: DatabaseErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            DatabaseOperation::Connect,
            DatabaseErrorKind::ConnectionFailed,
            message,
        )
    }

    /// Create a query failed error
    pub fn query_failed(operation: DatabaseOperation, message: impl Into<String>) -> Self {
        Self::new(operation, DatabaseErrorKind::QueryFailed, message)
    }

    /// Create a constraint violation error
    pub fn constraint_violation(operation: DatabaseOperation, message: impl Into<String>) -> Self {
        Self::new(operation, DatabaseErrorKind::ConstraintViolation, message)
    }

    /// Create a transaction failed error
    pub fn transaction_failed(message: impl Into<String>) -> Self {
        Self::new(
            DatabaseOperation::Transaction,
            DatabaseErrorKind::TransactionFailed,
            message,
        )
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::new(
            DatabaseOperation::Query,
            DatabaseErrorKind::TypeConversion,
            message,
        )
    }

    /// Check if this error is retriable (transient errors that may succeed on retry)
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionFailed | DatabaseErrorKind::TransactionFailed
        )
    }

    /// Add context to an existing error
    pub fn add_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Database {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let Some(ref ctx) = self.context {
            write!(f, " [context: {}]", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for DatabaseError {}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Structured database error with operation context
    #[error("{0}")]
    Database(DatabaseError),

    /// JSON encoding or decoding of a business row failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The unit-of-work was used in a way it does not allow
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<DatabaseError> for Error {
    fn from(err: DatabaseError) -> Self {
        Error::Database(err)
    }
}

#[cfg(feature = "turso")]
impl From<libsql::Error> for Error {
    fn from(err: libsql::Error) -> Self {
        Error::Database(classify_libsql_error(&err))
    }
}

/// Map a libsql error onto the structured database error
#[cfg(feature = "turso")]
pub(crate) fn classify_libsql_error(err: &libsql::Error) -> DatabaseError {
    let message = err.to_string();
    let lower = message.to_lowercase();

    if lower.contains("constraint") || lower.contains("immutable") || lower.contains("unique") {
        DatabaseError::constraint_violation(DatabaseOperation::Query, message)
    } else if lower.contains("transaction") {
        DatabaseError::transaction_failed(message)
    } else if lower.contains("unable to open") || lower.contains("connect") {
        DatabaseError::connection_failed(message)
    } else {
        DatabaseError::new(DatabaseOperation::Query, DatabaseErrorKind::Other, message)
    }
}

/// Faults raised inside the per-object capture pipeline
///
/// These are absorbed at the object boundary and recorded as diagnostics on
/// the unit-of-work; they are never returned from a flush.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The storage layer could not produce field history for an object
    #[error("history unavailable for field '{field}': {source}")]
    History {
        /// Field whose history lookup failed
        field: String,
        /// Underlying storage-layer failure
        #[source]
        source: anyhow::Error,
    },

    /// An entity callback panicked while being inspected
    #[error("entity inspection panicked: {0}")]
    Panicked(String),

    /// Any other failure reported by a storage layer
    #[error(transparent)]
    Tracking(#[from] anyhow::Error),
}

impl CaptureError {
    /// Convert a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked(message)
    }
}
