//! Bounded pool of reusable, health-checked connections
//!
//! The pool keeps at most `max_connections` live handles keyed by an
//! identifier (a mailbox address, a database DSN, ...). Resources are created
//! by factories registered per resource class and only need to implement the
//! `PooledResource` capability trait.
//!
//! Slot lifecycle:
//! 1. `acquire()` on a missing identifier → factory creates the handle (`live`)
//! 2. `acquire()` on a live identifier → probe, refresh `last_used_at`, reuse
//! 3. older than the TTL → `stale`, closed on next access or periodic sweep
//! 4. probe fails → `unhealthy`, closed and recreated
//! 5. pool full → least-recently-used slot is evicted to make room
//!
//! One pool per process. Native handles are never shared across processes.

pub mod error;
pub mod pool;
pub mod resource;

pub use error::{Error, Result};
pub use pool::{Pool, PoolConfig, PoolStats};
pub use resource::{PooledResource, ResourceFactory};
