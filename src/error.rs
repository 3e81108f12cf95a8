//! Crate-wide error taxonomy.
//!
//! Every operation submitted to the engine ends with exactly one
//! `Result<_, Error>`. A single connection failure is delivered to every
//! pending operation, so [`Error`] is `Clone` and I/O errors are shared
//! through an [`Arc`].
use std::{fmt, io, sync::Arc};

use thiserror::Error;

use crate::{
    codec::CodecError, protocol::HandshakeError, protocol::consts::error_code,
    schema::SchemaError,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("{0} timed out")]
    Timeout(TimeoutKind),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
}

impl Error {
    /// Whether a retry against a healthy connection may succeed.
    ///
    /// Connection failures other than a close or exhausted reconnects are transient, as
    /// are the server codes listed in [`ServerError::is_transient`].
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(ConnectionError::Closed(_) | ConnectionError::Exhausted { .. }) => {
                false
            }
            Error::Connection(_) => true,
            Error::Server(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn server_code(&self) -> Option<u32> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Connection(ConnectionError::Io(Arc::new(value)))
    }
}

/// Failures of the socket or of the connection lifecycle.
#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("gave up after {attempts} connection attempts, last error: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("not connected")]
    NotConnected,
}

impl From<io::Error> for ConnectionError {
    fn from(value: io::Error) -> Self {
        ConnectionError::Io(Arc::new(value))
    }
}

/// A nonzero status returned by the server.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct ServerError {
    pub code: u32,
    pub message: String,
}

impl ServerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Codes the server uses for conditions that clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            error_code::READONLY
                | error_code::TIMEOUT
                | error_code::WRONG_SCHEMA_VERSION
                | error_code::LOADING
                | error_code::LOCAL_INSTANCE_ID_IS_READ_ONLY
        )
    }

    pub fn is_wrong_schema_version(&self) -> bool {
        self.code == error_code::WRONG_SCHEMA_VERSION
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Waiting for room in the shared outbound buffer.
    Write,
    /// Waiting for the response to a single operation.
    Operation,
    /// Waiting for the first connection to become alive.
    Init,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Write => write!(f, "write"),
            TimeoutKind::Operation => write!(f, "operation"),
            TimeoutKind::Init => write!(f, "initial connect"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        for code in [7, 78, 109, 116, 128] {
            assert!(Error::Server(ServerError::new(code, "")).is_transient());
        }
        assert!(!Error::Server(ServerError::new(36, "no such space")).is_transient());

        let io = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(Error::from(io).is_transient());
        assert!(!Error::Connection(ConnectionError::Closed("bye".into())).is_transient());
        assert!(!Error::Timeout(TimeoutKind::Operation).is_transient());
    }

    #[test]
    fn errors_clone_for_fan_out() {
        let err = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
