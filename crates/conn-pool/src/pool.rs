//! Pool state machine, LRU eviction and lazy health checks
//!
//! Slot bookkeeping happens under one `tokio::sync::Mutex`: the size check,
//! eviction and reservation in `acquire()` are a single critical section, so
//! the pool can never grow past `max_connections`. Factories, probes and
//! shutdowns run with the lock released. A key being created holds a
//! pending slot that counts toward capacity; other callers for that key
//! wait on it instead of opening a second connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::resource::{PooledResource, ResourceFactory};

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Age after which a slot is stale regardless of health.
    pub ttl: Duration,
    /// Minimum spacing between opportunistic stale sweeps.
    pub sweep_interval: Duration,
    pub health_check_timeout: Duration,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters and current occupancy, for `/health` and logs.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub max_connections: usize,
    pub hits: u64,
    pub misses: u64,
    pub created: u64,
    pub evicted: u64,
    pub expired: u64,
    pub unhealthy: u64,
    pub closed: u64,
    pub by_class: BTreeMap<String, usize>,
}

struct Entry<R> {
    class: String,
    handle: Arc<R>,
    created_at: Instant,
    last_used_at: Instant,
}

enum Slot<R> {
    Ready(Entry<R>),
    /// A factory call is in flight. Its `acquire` owns the sender; a closed
    /// channel means that call was cancelled before finishing.
    Pending {
        class: String,
        done: watch::Receiver<()>,
    },
}

impl<R> Slot<R> {
    fn class(&self) -> &str {
        match self {
            Slot::Ready(entry) => &entry.class,
            Slot::Pending { class, .. } => class,
        }
    }

    fn abandoned(&self) -> bool {
        matches!(self, Slot::Pending { done, .. } if done.has_changed().is_err())
    }
}

struct Slots<R> {
    entries: HashMap<String, Slot<R>>,
    last_sweep: Instant,
}

impl<R> Slots<R> {
    fn ready(&self) -> impl Iterator<Item = (&String, &Entry<R>)> {
        self.entries.iter().filter_map(|(id, slot)| match slot {
            Slot::Ready(entry) => Some((id, entry)),
            Slot::Pending { .. } => None,
        })
    }
}

/// A slot taken out of the pool, shut down once the lock is released.
struct Retired<R> {
    identifier: String,
    entry: Entry<R>,
    reason: CloseReason,
}

/// What `acquire` does next after inspecting the slot table.
enum Step<R> {
    Wait(watch::Receiver<()>),
    Probe(Arc<R>),
    Create(watch::Sender<()>),
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
    unhealthy: AtomicU64,
    closed: AtomicU64,
}

/// Why a slot is being torn down.
#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Expired,
    Unhealthy,
    Evicted,
    Explicit,
    Shutdown,
}

impl CloseReason {
    fn label(&self) -> &'static str {
        match self {
            CloseReason::Expired => "expired",
            CloseReason::Unhealthy => "unhealthy",
            CloseReason::Evicted => "evicted",
            CloseReason::Explicit => "closed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Connection pool generic over the pooled resource type.
///
/// Handles are shared as `Arc<R>`; the pool keeps ownership of the slot and
/// is the only party that shuts a resource down.
pub struct Pool<R: PooledResource> {
    config: PoolConfig,
    factories: HashMap<String, Arc<dyn ResourceFactory<R>>>,
    slots: Mutex<Slots<R>>,
    counters: Counters,
}

impl<R: PooledResource> Pool<R> {
    pub fn new(config: PoolConfig) -> Self {
        info!(
            max_connections = config.max_connections,
            ttl_secs = config.ttl.as_secs(),
            "connection pool initialized"
        );
        Self {
            config,
            factories: HashMap::new(),
            slots: Mutex::new(Slots {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            counters: Counters::default(),
        }
    }

    /// Register the factory for a resource class. Call before sharing the pool.
    pub fn register(&mut self, class: impl Into<String>, factory: Arc<dyn ResourceFactory<R>>) {
        let class = class.into();
        debug!(class, "resource factory registered");
        self.factories.insert(class, factory);
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a live handle for `identifier`, reusing a healthy pooled one.
    ///
    /// Evicts the least-recently-used slot when full (ties go to the lowest
    /// identifier). Fails with `PoolExhausted` if no room can be made and
    /// with `Create`/`Timeout` if the factory cannot produce a handle.
    pub async fn acquire(&self, class: &str, identifier: &str) -> Result<Arc<R>> {
        let factory = self
            .factories
            .get(class)
            .cloned()
            .ok_or_else(|| Error::UnknownClass(class.to_string()))?;

        loop {
            let mut retired = Vec::new();
            let step = {
                let mut slots = self.slots.lock().await;
                self.plan(&mut slots, class, identifier, &mut retired)
            };
            self.retire(retired).await;

            match step? {
                Step::Wait(mut done) => {
                    debug!(identifier, class, "waiting for in-flight connection");
                    // Resolves once the creating call finishes or is dropped.
                    let _ = done.changed().await;
                }
                Step::Probe(handle) => {
                    if let Some(handle) = self.checkout(class, identifier, handle).await {
                        return Ok(handle);
                    }
                }
                Step::Create(reservation) => {
                    return self
                        .create(factory.as_ref(), class, identifier, reservation)
                        .await;
                }
            }
        }
    }

    /// Mark a handle as returned. Refreshes its LRU position.
    ///
    /// Returns false if the identifier is not pooled (already evicted).
    pub async fn release(&self, identifier: &str) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.entries.get_mut(identifier) {
            Some(Slot::Ready(entry)) => {
                entry.last_used_at = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Shut down and remove one slot. Returns whether it existed.
    pub async fn close(&self, identifier: &str) -> bool {
        let retired = {
            let mut slots = self.slots.lock().await;
            self.take_slot(&mut slots, identifier, CloseReason::Explicit)
        };
        let existed = retired.is_some();
        self.retire(retired.into_iter().collect()).await;
        existed
    }

    /// Shut down every live slot unconditionally (process shutdown).
    ///
    /// Connections still being created are left to their callers.
    pub async fn close_all(&self) -> usize {
        let retired: Vec<Retired<R>> = {
            let mut slots = self.slots.lock().await;
            let identifiers: Vec<String> = slots.ready().map(|(id, _)| id.clone()).collect();
            identifiers
                .iter()
                .filter_map(|id| self.take_slot(&mut slots, id, CloseReason::Shutdown))
                .collect()
        };
        let closed = retired.len();
        self.retire(retired).await;
        info!(closed, "connection pool drained");
        closed
    }

    /// Close every stale slot now, ignoring the sweep throttle.
    pub async fn sweep(&self) -> usize {
        let retired = {
            let mut slots = self.slots.lock().await;
            self.sweep_expired(&mut slots, Instant::now())
        };
        let closed = retired.len();
        self.retire(retired).await;
        closed
    }

    /// Close stale slots if `sweep_interval` has passed since the last sweep.
    pub async fn sweep_if_stale(&self) -> usize {
        let retired = {
            let mut slots = self.slots.lock().await;
            self.sweep_if_due(&mut slots, Instant::now())
        };
        let closed = retired.len();
        self.retire(retired).await;
        closed
    }

    /// Number of live slots.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.ready().count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether `identifier` currently holds a live slot.
    pub async fn contains(&self, identifier: &str) -> bool {
        matches!(
            self.slots.lock().await.entries.get(identifier),
            Some(Slot::Ready(_))
        )
    }

    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().await;
        let mut by_class = BTreeMap::new();
        let mut size = 0;
        for (_, entry) in slots.ready() {
            *by_class.entry(entry.class.clone()).or_insert(0) += 1;
            size += 1;
        }
        PoolStats {
            size,
            max_connections: self.config.max_connections,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            unhealthy: self.counters.unhealthy.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            by_class,
        }
    }

    /// Pool summary for the health endpoint.
    ///
    /// `saturated` once every slot is taken (the next new identifier evicts).
    pub async fn health(&self) -> serde_json::Value {
        let stats = self.stats().await;
        let connections: Vec<serde_json::Value> = {
            let slots = self.slots.lock().await;
            let now = Instant::now();
            let mut rows: Vec<_> = slots
                .ready()
                .map(|(id, e)| {
                    serde_json::json!({
                        "identifier": id,
                        "class": e.class,
                        "age_secs": now.duration_since(e.created_at).as_secs(),
                        "idle_secs": now.duration_since(e.last_used_at).as_secs(),
                    })
                })
                .collect();
            rows.sort_by(|a, b| a["identifier"].as_str().cmp(&b["identifier"].as_str()));
            rows
        };
        let status = if stats.size >= stats.max_connections {
            "saturated"
        } else {
            "healthy"
        };
        serde_json::json!({
            "status": status,
            "stats": stats,
            "connections": connections,
        })
    }

    /// Decide the next step for `identifier` with the lock held.
    fn plan(
        &self,
        slots: &mut Slots<R>,
        class: &str,
        identifier: &str,
        retired: &mut Vec<Retired<R>>,
    ) -> Result<Step<R>> {
        let now = Instant::now();
        retired.extend(self.sweep_if_due(slots, now));
        let before = slots.entries.len();
        slots.entries.retain(|_, slot| !slot.abandoned());
        if slots.entries.len() < before {
            debug!(
                released = before - slots.entries.len(),
                "dropped reservations of cancelled acquires"
            );
        }

        let expired = match slots.entries.get(identifier) {
            Some(slot) if slot.class() != class => {
                return Err(Error::ClassMismatch {
                    identifier: identifier.to_string(),
                    existing: slot.class().to_string(),
                    requested: class.to_string(),
                });
            }
            Some(Slot::Pending { done, .. }) => return Ok(Step::Wait(done.clone())),
            Some(Slot::Ready(entry)) => {
                if now.duration_since(entry.created_at) < self.config.ttl {
                    return Ok(Step::Probe(entry.handle.clone()));
                }
                true
            }
            None => false,
        };
        if expired {
            retired.extend(self.take_slot(slots, identifier, CloseReason::Expired));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if slots.entries.len() >= self.config.max_connections {
            if let Some(victim) = least_recently_used(slots) {
                retired.extend(self.take_slot(slots, &victim, CloseReason::Evicted));
            }
        }
        if slots.entries.len() >= self.config.max_connections {
            return Err(Error::PoolExhausted(format!(
                "{} of {} slots in use, nothing to evict",
                slots.entries.len(),
                self.config.max_connections
            )));
        }

        let (reservation, done) = watch::channel(());
        slots.entries.insert(
            identifier.to_string(),
            Slot::Pending {
                class: class.to_string(),
                done,
            },
        );
        Ok(Step::Create(reservation))
    }

    /// Probe a pooled handle with the lock released, then confirm it is
    /// still the one in the slot. `None` sends `acquire` round again.
    async fn checkout(&self, class: &str, identifier: &str, handle: Arc<R>) -> Option<Arc<R>> {
        let healthy = self.probe(identifier, &handle).await;

        let mut slots = self.slots.lock().await;
        let current = matches!(
            slots.entries.get(identifier),
            Some(Slot::Ready(entry)) if Arc::ptr_eq(&entry.handle, &handle)
        );
        if !current {
            // Closed or replaced while probing.
            return None;
        }
        if healthy {
            if let Some(Slot::Ready(entry)) = slots.entries.get_mut(identifier) {
                entry.last_used_at = Instant::now();
            }
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("pool_connections_total", "event" => "hit").increment(1);
            debug!(identifier, class, "reusing pooled connection");
            return Some(handle);
        }
        let retired = self.take_slot(&mut slots, identifier, CloseReason::Unhealthy);
        drop(slots);
        self.retire(retired.into_iter().collect()).await;
        None
    }

    /// Run the factory for a reserved slot and publish the result.
    async fn create(
        &self,
        factory: &dyn ResourceFactory<R>,
        class: &str,
        identifier: &str,
        reservation: watch::Sender<()>,
    ) -> Result<Arc<R>> {
        let outcome =
            tokio::time::timeout(self.config.connect_timeout, factory.create(identifier)).await;

        let mut slots = self.slots.lock().await;
        let resource = match outcome {
            Ok(Ok(resource)) => resource,
            Ok(Err(message)) => {
                slots.entries.remove(identifier);
                warn!(identifier, class, error = %message, "connection factory failed");
                return Err(Error::Create {
                    class: class.to_string(),
                    identifier: identifier.to_string(),
                    message,
                });
            }
            Err(_) => {
                slots.entries.remove(identifier);
                warn!(identifier, class, "connection factory timed out");
                return Err(Error::Timeout(format!(
                    "creating {class} connection {identifier} after {}s",
                    self.config.connect_timeout.as_secs()
                )));
            }
        };

        let handle = Arc::new(resource);
        let created_at = Instant::now();
        slots.entries.insert(
            identifier.to_string(),
            Slot::Ready(Entry {
                class: class.to_string(),
                handle: handle.clone(),
                created_at,
                last_used_at: created_at,
            }),
        );
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pool_connections_total", "event" => "created").increment(1);
        info!(
            identifier,
            class,
            size = slots.ready().count(),
            "pooled connection created"
        );
        drop(slots);
        drop(reservation);
        Ok(handle)
    }

    async fn probe(&self, identifier: &str, handle: &R) -> bool {
        match tokio::time::timeout(self.config.health_check_timeout, handle.validate()).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(identifier, "health check failed");
                false
            }
            Err(_) => {
                warn!(identifier, "health check timed out");
                false
            }
        }
    }

    fn sweep_if_due(&self, slots: &mut Slots<R>, now: Instant) -> Vec<Retired<R>> {
        if now.duration_since(slots.last_sweep) < self.config.sweep_interval {
            return Vec::new();
        }
        self.sweep_expired(slots, now)
    }

    fn sweep_expired(&self, slots: &mut Slots<R>, now: Instant) -> Vec<Retired<R>> {
        slots.last_sweep = now;
        let stale: Vec<String> = slots
            .ready()
            .filter(|(_, e)| now.duration_since(e.created_at) >= self.config.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        if !stale.is_empty() {
            debug!(closed = stale.len(), "swept stale connections");
        }
        stale
            .iter()
            .filter_map(|id| self.take_slot(slots, id, CloseReason::Expired))
            .collect()
    }

    /// Remove a live slot and count the close. Pending slots are untouched.
    fn take_slot(
        &self,
        slots: &mut Slots<R>,
        identifier: &str,
        reason: CloseReason,
    ) -> Option<Retired<R>> {
        if !matches!(slots.entries.get(identifier), Some(Slot::Ready(_))) {
            return None;
        }
        let Some(Slot::Ready(entry)) = slots.entries.remove(identifier) else {
            return None;
        };

        let counter = match reason {
            CloseReason::Expired => &self.counters.expired,
            CloseReason::Unhealthy => &self.counters.unhealthy,
            CloseReason::Evicted => &self.counters.evicted,
            CloseReason::Explicit | CloseReason::Shutdown => &self.counters.closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pool_connections_total", "event" => reason.label()).increment(1);
        Some(Retired {
            identifier: identifier.to_string(),
            entry,
            reason,
        })
    }

    /// Shut removed resources down. Failures are logged.
    async fn retire(&self, retired: Vec<Retired<R>>) {
        for Retired {
            identifier,
            entry,
            reason,
        } in retired
        {
            match tokio::time::timeout(self.config.shutdown_timeout, entry.handle.shutdown()).await
            {
                Ok(Ok(())) => {
                    debug!(identifier, class = %entry.class, reason = reason.label(), "pooled connection closed");
                }
                Ok(Err(e)) => {
                    warn!(identifier, class = %entry.class, reason = reason.label(), error = %e, "connection shutdown failed");
                }
                Err(_) => {
                    warn!(identifier, class = %entry.class, reason = reason.label(), "connection shutdown timed out");
                }
            }
        }
    }
}

/// LRU victim among live slots: oldest `last_used_at`, ties broken by
/// lowest identifier.
fn least_recently_used<R>(slots: &Slots<R>) -> Option<String> {
    slots
        .ready()
        .min_by(|(a_id, a), (b_id, b)| {
            a.last_used_at
                .cmp(&b.last_used_at)
                .then_with(|| a_id.cmp(b_id))
        })
        .map(|(id, _)| id.clone())
}
