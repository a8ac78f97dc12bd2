//! Capability traits implemented by pooled resources and their factories

use common::BoxFuture;

/// A live handle the pool can probe and shut down.
///
/// Implemented once per resource kind (database connection, IMAP/SMTP
/// session, ...). The pool never needs the concrete type beyond this.
pub trait PooledResource: Send + Sync + 'static {
    /// Cheap round-trip probe (ping, NOOP). `false` marks the slot unhealthy.
    fn validate(&self) -> BoxFuture<'_, bool>;

    /// Disconnect. Errors are logged by the pool and never propagated.
    fn shutdown(&self) -> BoxFuture<'_, Result<(), String>>;
}

/// Heterogeneous pools hold boxed resources of several classes.
impl PooledResource for Box<dyn PooledResource> {
    fn validate(&self) -> BoxFuture<'_, bool> {
        (**self).validate()
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), String>> {
        (**self).shutdown()
    }
}

/// Constructor for one resource class.
pub trait ResourceFactory<R>: Send + Sync {
    /// Open a new connection for `identifier`.
    fn create<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, Result<R, String>>;
}
