//! Error types for rate limiter operations

use std::time::Duration;

use common::{Classify, ErrorClass};

/// Errors from rate limiter operations.
///
/// A denied admission check is not an error (`Admission::Denied`); it only
/// becomes `QuotaExceeded` when a caller asks for it via `ensure_allowed`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("quota exceeded for {service}: {reason} (retry in {}s)", .retry_after.as_secs())]
    QuotaExceeded {
        service: String,
        reason: String,
        retry_after: Duration,
    },

    #[error("service not configured: {0}")]
    UnknownService(String),

    #[error("usage store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::QuotaExceeded { .. } => ErrorClass::QuotaExceeded,
            Error::UnknownService(_) => ErrorClass::Configuration,
            Error::Store(_) => ErrorClass::Transient,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::QuotaExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, Error>;
