//! Error types for credential refresh

use common::{Classify, ErrorClass};

/// Errors from credential storage, locking and token refresh.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    TokenExchange(String),

    /// The provider rejected the refresh token (`invalid_grant`, 401, 403).
    #[error("refresh grant rejected: {0}")]
    InvalidGrant(String),

    /// Sticky state set after a rejected grant; cleared by `reauthorize`.
    #[error("credential {0} needs re-authorization")]
    NeedsReauth(String),

    #[error("timed out waiting for refresh lock on {0}")]
    LockTimeout(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidGrant(_) | Error::NeedsReauth(_) => ErrorClass::TerminalAuth,
            Error::CredentialParse(_) | Error::NotFound(_) => ErrorClass::Configuration,
            Error::Http(_)
            | Error::TokenExchange(_)
            | Error::LockTimeout(_)
            | Error::Timeout(_)
            | Error::Io(_) => ErrorClass::Transient,
        }
    }
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_grants_are_terminal() {
        assert_eq!(
            Error::InvalidGrant("revoked".into()).class(),
            ErrorClass::TerminalAuth
        );
        assert_eq!(
            Error::NeedsReauth("gmail-1".into()).class(),
            ErrorClass::TerminalAuth
        );
    }

    #[test]
    fn lock_contention_is_transient() {
        let err = Error::LockTimeout("gmail-1".into());
        assert!(err.class().is_retryable());
        assert!(err.to_string().contains("gmail-1"));
    }
}
