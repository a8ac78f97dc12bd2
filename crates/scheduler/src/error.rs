//! Error types for the job queue

use common::{Classify, ErrorClass};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job store error: {0}")]
    Store(String),

    #[error("corrupt job row {id}: {message}")]
    CorruptRow { id: i64, message: String },

    #[error("job {0} not found")]
    NotFound(i64),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::Store(_) => ErrorClass::Transient,
            Error::CorruptRow { .. } | Error::NotFound(_) => ErrorClass::Configuration,
        }
    }
}

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, Error>;
