//! Shared types for the outreach execution core
//!
//! Everything here is dependency-light so every other crate in the workspace
//! can pull it in: the configuration error type, the `Secret` wrapper, the
//! cross-crate error taxonomy and wall-clock helpers.

mod class;
mod error;
mod secret;
pub mod time;

pub use class::{Classify, ErrorClass};
pub use error::{Error, Result};
pub use secret::Secret;

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the dyn-compatible store and handler traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
