//! Error types for cache operations

use common::{Classify, ErrorClass};

/// Errors from cache persistence and configuration.
///
/// Lookups never fail: a miss is `None`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cache I/O error: {0}")]
    Io(String),

    #[error("cache serialization error: {0}")]
    Serialize(String),

    #[error("invalid cache configuration: {0}")]
    Config(String),
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::Io(_) | Error::Serialize(_) => ErrorClass::Transient,
            Error::Config(_) => ErrorClass::Configuration,
        }
    }
}

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
