//! Error types and retry classification for pgchain.
//!
//! Every failure that crosses the public boundary is an [`OrmError`]. Each
//! variant maps onto one [`ErrorCode`] of the taxonomy, and the classifier
//! ([`is_retriable_error`]) decides whether a failure is transient.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for pgchain operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Shared, clone-friendly error cause.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Low-level connection failure codes that are always worth a retry.
pub const RETRIABLE_CONNECTION_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ENOTFOUND",
    "EPIPE",
    "EAI_AGAIN",
];

/// Taxonomy tag carried by every [`OrmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Bad identifier, limit, or payload shape. Never retried.
    Validation,
    /// Backend execution failure.
    Query,
    /// Failed to obtain or keep a connection.
    Connection,
    /// Transaction callback, commit, or rollback failure.
    Transaction,
    /// `single()` matched zero rows.
    NotFound,
    /// `single()` / `maybe_single()` matched more than one row.
    TooManyRows,
    /// A result row could not be converted.
    Decode,
    /// Observer hook failure (always contained).
    Hook,
    /// The caller's abort signal fired.
    Aborted,
}

impl ErrorCode {
    /// Every tag, in taxonomy order.
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::Validation,
        ErrorCode::Query,
        ErrorCode::Connection,
        ErrorCode::Transaction,
        ErrorCode::NotFound,
        ErrorCode::TooManyRows,
        ErrorCode::Decode,
        ErrorCode::Hook,
        ErrorCode::Aborted,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Query => "QUERY",
            ErrorCode::Connection => "CONNECTION",
            ErrorCode::Transaction => "TRANSACTION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::TooManyRows => "TOO_MANY_ROWS",
            ErrorCode::Decode => "DECODE",
            ErrorCode::Hook => "HOOK",
            ErrorCode::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for query building and execution
#[derive(Debug, Clone, Error)]
pub enum OrmError {
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Query execution error
    #[error("Query error: {message}")]
    Query {
        message: String,
        /// Backend SQLSTATE, when the server reported one.
        status: Option<String>,
        #[source]
        source: Option<Cause>,
    },

    /// Database connection error
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// Transaction error
    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Query returned more rows than expected
    #[error("Too many rows: {message}")]
    TooManyRows {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// Row decode/mapping error
    #[error("Decode error on column '{column}': {message}")]
    Decode { column: String, message: String },

    /// Hook error
    #[error("Hook error: {0}")]
    Hook(String),

    /// Aborted by the caller
    #[error("Aborted: {0}")]
    Aborted(String),
}

impl OrmError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a query error without a backend cause
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Create a query error carrying a backend SQLSTATE
    pub fn query_status(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            status: Some(status.into()),
            source: None,
        }
    }

    /// Create a connection error without a cause
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a failure that happened inside a transaction scope
    pub fn transaction(message: impl Into<String>, cause: OrmError) -> Self {
        Self::Transaction {
            message: message.into(),
            source: Some(Arc::new(cause)),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a too-many-rows error
    pub fn too_many_rows(expected: usize, got: usize) -> Self {
        Self::TooManyRows {
            message: format!("expected {expected}, got {got}"),
            source: None,
        }
    }

    /// Create a decode error for a specific column
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a hook error
    pub fn hook(message: impl Into<String>) -> Self {
        Self::Hook(message.into())
    }

    /// Create an aborted error
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted(message.into())
    }

    /// Build a uniform error of kind `code` from an arbitrary cause.
    ///
    /// The message is the cause's own display text, or `fallback` when that is
    /// empty. A backend SQLSTATE anywhere in the cause chain is preserved.
    pub fn from_thrown<E>(code: ErrorCode, fallback: &str, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let cause: Cause = Arc::new(cause);
        let text = cause.to_string();
        let message = if text.trim().is_empty() {
            fallback.to_string()
        } else {
            text
        };
        let status = extract_status(cause.as_ref());

        match code {
            ErrorCode::Validation => Self::Validation(message),
            ErrorCode::Query => Self::Query {
                message,
                status,
                source: Some(cause),
            },
            ErrorCode::Connection => Self::Connection {
                message,
                source: Some(cause),
            },
            ErrorCode::Transaction => Self::Transaction {
                message,
                source: Some(cause),
            },
            ErrorCode::NotFound => Self::NotFound(message),
            ErrorCode::TooManyRows => Self::TooManyRows {
                message,
                source: Some(cause),
            },
            ErrorCode::Decode => Self::decode(String::new(), message),
            ErrorCode::Hook => Self::Hook(message),
            ErrorCode::Aborted => Self::Aborted(message),
        }
    }

    /// Convert a tokio_postgres error, keeping its SQLSTATE and cause.
    pub fn from_db_error(err: tokio_postgres::Error) -> Self {
        let (message, status) = match err.as_db_error() {
            Some(db_err) => {
                let message = match db_err.constraint() {
                    Some(constraint) => format!("{}: {}", constraint, db_err.message()),
                    None => db_err.message().to_string(),
                };
                (message, Some(db_err.code().code().to_string()))
            }
            None => (err.to_string(), None),
        };

        if status.is_none() && err.is_closed() {
            return Self::Connection {
                message,
                source: Some(Arc::new(err)),
            };
        }

        Self::Query {
            message,
            status,
            source: Some(Arc::new(err)),
        }
    }

    /// The taxonomy tag of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Query { .. } => ErrorCode::Query,
            Self::Connection { .. } => ErrorCode::Connection,
            Self::Transaction { .. } => ErrorCode::Transaction,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::TooManyRows { .. } => ErrorCode::TooManyRows,
            Self::Decode { .. } => ErrorCode::Decode,
            Self::Hook(_) => ErrorCode::Hook,
            Self::Aborted(_) => ErrorCode::Aborted,
        }
    }

    /// Backend SQLSTATE, if known.
    pub fn status(&self) -> Option<&str> {
        match self {
            Self::Query { status, .. } => status.as_deref(),
            _ => None,
        }
    }

    /// The underlying cause, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Query { source, .. }
            | Self::Connection { source, .. }
            | Self::Transaction { source, .. }
            | Self::TooManyRows { source, .. } => source.as_ref(),
            _ => None,
        }
    }

    /// Check if this is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is an aborted error
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Whether this failure is transient and eligible for backoff-retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Query { .. } | Self::Connection { .. } => is_retriable_error(self),
            _ => false,
        }
    }
}

impl Serialize for OrmError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("OrmError", 3)?;
        s.serialize_field("code", self.code().as_str())?;
        s.serialize_field("message", &self.to_string())?;
        s.serialize_field("status", &self.status())?;
        s.end()
    }
}

#[cfg(feature = "pool")]
impl From<deadpool_postgres::PoolError> for OrmError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Connection {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

/// SQLSTATE classes 08 (connection exception) and 40 (transaction rollback).
pub fn is_retriable_status(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("40")
}

/// Decide whether a failure is transient by walking its cause chain.
pub fn is_retriable_error(cause: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(cause);
    while let Some(err) = current {
        if let Some(orm) = err.downcast_ref::<OrmError>() {
            match orm {
                OrmError::Query { status: Some(code), .. } => return is_retriable_status(code),
                OrmError::Query { .. } | OrmError::Connection { .. } => {}
                _ => return false,
            }
        } else if let Some(pg) = err.downcast_ref::<tokio_postgres::Error>() {
            if let Some(db_err) = pg.as_db_error() {
                return is_retriable_status(db_err.code().code());
            }
            if pg.is_closed() {
                return true;
            }
        } else if let Some(db_err) = err.downcast_ref::<tokio_postgres::error::DbError>() {
            return is_retriable_status(db_err.code().code());
        } else if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io_error_code(io).is_some() {
                return true;
            }
        }

        if mentions_connection_code(&err.to_string()) {
            return true;
        }
        current = next_cause(err);
    }
    false
}

/// Step down a cause chain, looking through the shared [`Cause`] of an
/// [`OrmError`] rather than at the `Arc` wrapper `source()` reports.
fn next_cause<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a (dyn StdError + 'static)> {
    match err.downcast_ref::<OrmError>() {
        Some(orm) => orm.cause().map(|cause| cause.as_ref() as &(dyn StdError + 'static)),
        None => err.source(),
    }
}

/// Map an I/O error onto one of [`RETRIABLE_CONNECTION_CODES`].
pub fn io_error_code(err: &std::io::Error) -> Option<&'static str> {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => Some("ECONNRESET"),
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::NotFound => Some("ENOTFOUND"),
        ErrorKind::BrokenPipe => Some("EPIPE"),
        _ if is_dns_retry_text(&err.to_string()) => Some("EAI_AGAIN"),
        _ => None,
    }
}

fn mentions_connection_code(text: &str) -> bool {
    RETRIABLE_CONNECTION_CODES.iter().any(|code| text.contains(code)) || is_dns_retry_text(text)
}

fn is_dns_retry_text(text: &str) -> bool {
    text.contains("Temporary failure in name resolution")
}

/// Find the first SQLSTATE in a cause chain.
fn extract_status(cause: &(dyn StdError + 'static)) -> Option<String> {
    let mut current = Some(cause);
    while let Some(err) = current {
        if let Some(orm) = err.downcast_ref::<OrmError>() {
            if let Some(code) = orm.status() {
                return Some(code.to_string());
            }
        } else if let Some(pg) = err.downcast_ref::<tokio_postgres::Error>() {
            if let Some(db_err) = pg.as_db_error() {
                return Some(db_err.code().code().to_string());
            }
        } else if let Some(db_err) = err.downcast_ref::<tokio_postgres::error::DbError>() {
            return Some(db_err.code().code().to_string());
        }
        current = next_cause(err);
    }
    None
}
