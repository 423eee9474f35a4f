//! Error vocabulary shared by every dfpeer component
//!
//! The variants mirror the small, fixed set of status codes exposed at the
//! RPC boundary. `Closed` and `Cancelled` only occur inside the sync engine
//! and are folded into boundary codes by [`Error::code`].

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    #[error("internal error: {0}")]
    Internal(String),

    /// Session terminated before a response arrived
    #[error("session closed")]
    Closed,

    /// Caller-supplied cancellation fired
    #[error("cancelled")]
    Cancelled,
}

/// Transport status codes (gRPC-compatible numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Cancelled = 1,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    Aborted = 10,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
}

impl Code {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl Error {
    /// Status code used when this error crosses the RPC boundary
    pub fn code(&self) -> Code {
        match self {
            Error::NotFound(_) => Code::NotFound,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::Conflict(_) => Code::Aborted,
            Error::Unavailable(_) | Error::Closed => Code::Unavailable,
            Error::Timeout(_) => Code::DeadlineExceeded,
            Error::Unimplemented(_) => Code::Unimplemented,
            Error::Internal(_) => Code::Internal,
            Error::Cancelled => Code::Cancelled,
        }
    }

    /// Transient failures worth retrying against the same or another peer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Unavailable(_) | Error::Closed
        )
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn internal(what: impl std::fmt::Display) -> Self {
        Error::Internal(what.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Internal(format!("sled: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
