//! TTL response cache for metered external calls
//!
//! Responses are keyed by `CacheKey::derive(operation, target, params)` so
//! identical lookups issued by different jobs share one upstream request.
//! Expiry is lazy: `get()` reports a miss for an expired entry, and rows are
//! only removed by the opportunistic sweep on `set()` or by `purge_expired()`.
//!
//! The cache is in-memory with optional persistence to a JSON file, written
//! atomically (temp file + rename) after every mutation.

pub mod cache;
pub mod config;
pub mod error;
pub mod key;
mod persist;

pub use cache::{CacheEntry, CacheStats, Fetched, Invalidation, ResponseCache};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use key::CacheKey;
