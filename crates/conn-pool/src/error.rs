//! Error types for pool operations

use common::{Classify, ErrorClass};

/// Errors from pool operations.
///
/// A missing or expired slot is not an error; `acquire()` simply creates a
/// new one. Only failures to produce a usable handle surface here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("no factory registered for resource class {0}")]
    UnknownClass(String),

    #[error("{identifier} is pooled as {existing}, requested as {requested}")]
    ClassMismatch {
        identifier: String,
        existing: String,
        requested: String,
    },

    #[error("failed to create {class} connection {identifier}: {message}")]
    Create {
        class: String,
        identifier: String,
        message: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::PoolExhausted(_) => ErrorClass::PoolExhausted,
            Error::UnknownClass(_) | Error::ClassMismatch { .. } => ErrorClass::Configuration,
            Error::Create { .. } | Error::Timeout(_) => ErrorClass::Transient,
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
