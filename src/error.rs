use serde_json::Value;
use thiserror::Error;

/// Errors reported by the driver.
///
/// Payloads are owned strings/values so the error stays `Clone`: the same
/// error may settle several pending waiters and is also recorded as the
/// socket's last error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {message}")]
    Auth {
        message: String,
        error_code: Option<u64>,
    },

    #[error("Query timed out")]
    Timeout,

    #[error("Query cancelled")]
    Cancel,

    #[error("Query error: {message}")]
    Query {
        message: String,
        term: Option<Value>,
        backtrace: Option<Value>,
    },

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    pub(crate) fn connection(msg: impl Into<String>) -> Self {
        DriverError::Connection(msg.into())
    }

    pub(crate) fn auth(msg: impl Into<String>) -> Self {
        DriverError::Auth {
            message: msg.into(),
            error_code: None,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        DriverError::Protocol(msg.into())
    }

    /// Error used when the transport goes away under pending queries.
    pub(crate) fn closed_before_completion() -> Self {
        DriverError::Connection(
            "the connection was closed before the query could be completed".to_string(),
        )
    }

    /// True for errors that indicate the connection itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Connection(_) | DriverError::Auth { .. }
        )
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::Protocol(format!("JSON error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
