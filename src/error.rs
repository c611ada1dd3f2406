//! Error types for the EdgeDB client.
//!
//! Every fallible operation in the crate returns [`Error`]. Query execution
//! surfaces exactly one of [`Error::Database`], [`Error::Timeout`],
//! [`Error::MissingCodec`] or a wrapped [`Error::Execution`].

use thiserror::Error;

use crate::binary::packet::Headers;
use crate::binary::protocol::ErrorSeverity;

const IDLE_SESSION_TIMEOUT: u32 = 0x0406_0100;
const TRANSACTION_CONFLICT: u32 = 0x0503_0100;
const TRANSACTION_DEADLOCK: u32 = 0x0503_0102;
const BACKEND_UNAVAILABLE: u32 = 0x0800_0001;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unexpected message from the server.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A read ran past the end of a message or a length-prefixed block.
    #[error("Unexpected end of stream: needed {needed} bytes, {remaining} remaining")]
    EndOfStream { needed: usize, remaining: usize },

    /// The server answered with an `ErrorResponse`.
    #[error("{severity}: {message} (code 0x{code:08X})")]
    Database {
        severity: ErrorSeverity,
        code: u32,
        message: String,
        headers: Headers,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A reply wait expired. The socket is left open.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// No codec could be resolved or the codec cannot encode arguments.
    #[error("Missing codec: {0}")]
    MissingCodec(String),

    /// TLS failure, refused connection or unexpected socket close.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A value does not fit the codec it was handed to.
    #[error("Type conversion error: {0}")]
    Type(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A transaction was used after it failed or finished.
    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure during a prepare/execute cycle.
    #[error("Failed to execute query `{query}`: {source}")]
    Execution {
        query: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// True for server-reported errors.
    pub fn is_database(&self) -> bool {
        matches!(self, Error::Database { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Server error code, if this is a database error.
    pub fn database_code(&self) -> Option<u32> {
        match self {
            Error::Database { code, .. } => Some(*code),
            Error::Execution { source, .. } => source.database_code(),
            _ => None,
        }
    }

    /// The operation may succeed on a fresh connection.
    pub fn should_reconnect(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Io(_) | Error::Timeout(_) => true,
            Error::Database { code, .. } => *code == IDLE_SESSION_TIMEOUT,
            Error::Execution { source, .. } => source.should_reconnect(),
            _ => false,
        }
    }

    /// Transaction conflicts and an unavailable backend; running the same
    /// work again may succeed.
    pub fn should_retry(&self) -> bool {
        matches!(
            self.database_code(),
            Some(TRANSACTION_CONFLICT..=TRANSACTION_DEADLOCK | BACKEND_UNAVAILABLE)
        )
    }

    /// Server error message, if this is a database error.
    pub fn database_message(&self) -> Option<&str> {
        match self {
            Error::Database { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Wrap everything but database, timeout and codec errors into an
    /// execution error carrying the query text.
    pub(crate) fn into_execution(self, query: &str) -> Error {
        match self {
            err @ (Error::Database { .. }
            | Error::Timeout(_)
            | Error::MissingCodec(_)
            | Error::Execution { .. }) => err,
            other => Error::Execution {
                query: query.to_string(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_execution_keeps_distinct_kinds() {
        let timeout = Error::Timeout("PrepareComplete".into()).into_execution("select 1");
        assert!(timeout.is_timeout());

        let codec = Error::MissingCodec("x".into()).into_execution("select 1");
        assert!(matches!(codec, Error::MissingCodec(_)));

        let wrapped = Error::Protocol("bad".into()).into_execution("select 1");
        match wrapped {
            Error::Execution { query, source } => {
                assert_eq!(query, "select 1");
                assert!(matches!(*source, Error::Protocol(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_database_error_display() {
        let err = Error::Database {
            severity: ErrorSeverity::Error,
            code: 0x0501_0001,
            message: "division by zero".into(),
            headers: Headers::new(),
        };
        assert_eq!(err.to_string(), "ERROR: division by zero (code 0x05010001)");
        assert_eq!(err.database_message(), Some("division by zero"));
    }

    fn database(code: u32) -> Error {
        Error::Database {
            severity: ErrorSeverity::Error,
            code,
            message: "x".into(),
            headers: Headers::new(),
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(database(0x0503_0101).should_retry());
        assert!(database(0x0800_0001).should_retry());
        assert!(!database(0x0501_0001).should_retry());
        assert!(database(0x0406_0100).should_reconnect());

        let refused = Error::Connection("refused".into()).into_execution("select 1");
        assert!(refused.should_reconnect());
        assert!(!refused.should_retry());
        assert!(!Error::Authentication("bad".into()).should_reconnect());
        assert!(!Error::Config("bad".into()).should_reconnect());
    }
}
