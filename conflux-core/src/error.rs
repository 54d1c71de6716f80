//! Error Types
//!
//! All fallible operations in the crate return [`Error`]. The variants fall
//! into three groups:
//!
//! - Structural errors (`UnknownType`, `TypeMismatch`, `PathNotFound`, ...)
//!   are rejected at the edit that would introduce them. The network never
//!   enters an invalid state.
//! - Instance-level failures (`Callback`, `CommandFailed`, `Cancelled`) are
//!   captured on the instance that caused them and do not stop the rest of
//!   the network.
//! - `Persistence` errors are retried with backoff on checkpoint and are
//!   fatal on restore.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for all dataflow operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A type name was not found in the type registry.
    #[error("unknown type '{0}'")]
    UnknownType(String),

    /// A value or connection endpoint does not match the expected type.
    #[error("type mismatch at {at}: expected {expected}, found {found}")]
    TypeMismatch {
        at: String,
        expected: String,
        found: String,
    },

    /// A required record field is absent.
    #[error("missing required field '{0}'")]
    MissingField(String),

    /// A function name was not found in the function registry.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// An instance id was not found in the network it was looked up in.
    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    /// A subvalue path does not resolve to a node.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// A path string does not conform to the path grammar.
    #[error("cannot parse path '{0}': {1}")]
    PathParse(String, String),

    /// An identifier is empty, malformed, or a reserved word.
    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),

    /// Adding a connection would close a loop with no command-emitting
    /// instance in it.
    #[error("connection {0} -> {1} would create a stateless cycle")]
    CycleDetected(String, String),

    /// An instance with this id already exists in the network.
    #[error("duplicate instance '{0}'")]
    DuplicateInstance(String),

    /// A registry was written to after the activation phase began.
    #[error("{0} registry is frozen")]
    RegistryFrozen(&'static str),

    /// A function callback reported or raised an error.
    #[error("callback error: {0}")]
    Callback(String),

    /// An external command returned a failure status.
    #[error("command {0} failed: {1}")]
    CommandFailed(u64, String),

    /// A snapshot or scratch store operation failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The instance or engine was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}
