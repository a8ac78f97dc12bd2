//! Configuration and bootstrap errors

use thiserror::Error;

use crate::{Classify, ErrorClass};

/// Errors raised while loading settings. Always fatal at startup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Shorthand for a `Config` error with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
