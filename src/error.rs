//! Engine error kinds
//!
//! Every public engine operation returns one of these rather than panicking.
//! The HTTP layer turns them into a `Failure` (kind + message).

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("path {id} not found")]
    NotFound { id: u32 },

    #[error("no identifier available in range {min}..={max}")]
    NoIdentifierAvailable { min: u32, max: u32 },

    #[error("model '{name}' not found in catalog")]
    UnknownModel { name: String },

    #[error("`{command}` failed: {reason}")]
    ShapingCommandFailed { command: String, reason: String },

    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("lock {} unavailable: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot persist {}: {message}", path.display())]
    Persistence { path: PathBuf, message: String },

    #[error("path {id} worker failed to start: {reason}")]
    WorkerStart { id: u32, reason: String },

    #[error("shutdown sweep did not finish within {waited:?}")]
    ShutdownTimeout { waited: Duration },
}

/// Stable, serialisable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    NoIdentifierAvailable,
    UnknownModel,
    ShapingCommandFailed,
    LockTimeout,
    InvalidSelector,
    Internal,
}

/// Structured failure result handed to the outer layers.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::NoIdentifierAvailable { .. } => ErrorKind::NoIdentifierAvailable,
            Error::UnknownModel { .. } => ErrorKind::UnknownModel,
            Error::ShapingCommandFailed { .. } => ErrorKind::ShapingCommandFailed,
            Error::LockTimeout { .. } => ErrorKind::LockTimeout,
            Error::InvalidSelector(_) => ErrorKind::InvalidSelector,
            Error::Lock { .. }
            | Error::InvalidConfig(_)
            | Error::Persistence { .. }
            | Error::WorkerStart { .. }
            | Error::ShutdownTimeout { .. } => ErrorKind::Internal,
        }
    }

    pub fn failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Error::Persistence {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
