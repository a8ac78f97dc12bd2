//! Serialized OAuth token refresh shared by concurrent workers
//!
//! Several worker processes read the same credential file. Only one of them
//! may spend a refresh token at a time, since most providers rotate it on
//! use and a second concurrent refresh would invalidate the first.
//!
//! Refresh protocol (`RefreshManager::refresh`):
//! 1. Fail fast if the credential is marked `needs_reauth`
//! 2. Take the per-resource advisory lock (bounded wait, stale locks reclaimed)
//! 3. Reload the credential file and re-check expiry; skip if another
//!    holder already refreshed it
//! 4. Call the token endpoint under a timeout
//! 5. Persist access token, refresh token and expiry in one atomic write,
//!    or mark `needs_reauth` when the grant was rejected
//! 6. Release the lock on every path

pub mod credentials;
pub mod error;
pub mod lock;
pub mod manager;
pub mod token;

pub use credentials::{Credential, CredentialStatus, CredentialStore};
pub use error::{Error, Result};
pub use lock::{AdvisoryLock, FileLock, LockLease, MemoryLock};
pub use manager::{CycleSummary, RefreshConfig, RefreshManager, RefreshOutcome};
pub use token::{OAuthRefresher, TokenRefresher, TokenResponse};
