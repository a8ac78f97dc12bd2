//! Service-specific error types

use std::net::SocketAddr;

use thiserror::Error;

/// Startup and lifecycle errors of the worker.
///
/// Per-job failures never surface here; the processor records them on the
/// job itself.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] common::Error),

    #[error("database unavailable: {0}")]
    Database(String),

    #[error("rate limiter setup failed: {0}")]
    Limiter(#[from] ratelimit::Error),

    #[error("job queue setup failed: {0}")]
    Queue(#[from] scheduler::Error),

    #[error("response cache setup failed: {0}")]
    Cache(#[from] response_cache::Error),

    #[error("credential store setup failed: {0}")]
    Credentials(#[from] credential_refresh::Error),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),

    #[error("failed to bind admin listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Database(e.to_string())
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = Error::from(common::Error::config("worker.batch_size must be greater than 0"));
        assert_eq!(
            err.to_string(),
            "Configuration error: worker.batch_size must be greater than 0"
        );

        let err = Error::Bind {
            addr: "127.0.0.1:9090".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("127.0.0.1:9090"));

        assert!(
            Error::Database("unable to open database file".into())
                .to_string()
                .contains("unable to open")
        );
    }
}
