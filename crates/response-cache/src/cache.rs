//! In-memory TTL cache with optional JSON file persistence

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::time::{millis, now_millis};
use rand::RngExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::persist;

/// One cached response. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub category: String,
    pub payload: Value,
    pub created_at: u64,
    pub expires_at: u64,
    pub access_count: u64,
    pub last_accessed_at: Option<u64>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Scope of an `invalidate()` call.
#[derive(Debug, Clone)]
pub enum Invalidation {
    Key(String),
    Category(String),
    All,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Expired rows still stored, awaiting a sweep.
    pub expired: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub by_category: BTreeMap<String, usize>,
    pub persistent: bool,
}

/// Result of `get_or_fetch()`.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub value: Value,
    pub from_cache: bool,
}

/// Response cache keyed by `CacheKey` strings.
///
/// A tokio Mutex guards the table. When a file path is configured every
/// mutation is persisted while the lock is held, so concurrent writers never
/// interleave snapshots. Access counters are updated in memory and reach
/// disk with the next mutation.
pub struct ResponseCache {
    config: CacheConfig,
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_entries(config, None, HashMap::new()))
    }

    /// Open a file-backed cache, creating the file if it does not exist.
    ///
    /// Entries already expired at load time are dropped.
    pub async fn load(config: CacheConfig, path: PathBuf) -> Result<Self> {
        config.validate()?;
        let entries = if path.exists() {
            let now = now_millis();
            let mut entries = persist::load(&path).await?;
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired_at(now));
            info!(
                path = %path.display(),
                entries = entries.len(),
                dropped = before - entries.len(),
                "loaded response cache"
            );
            entries
        } else {
            info!(path = %path.display(), "cache file not found, starting empty");
            let entries = HashMap::new();
            persist::write_atomic(&path, &entries).await?;
            entries
        };
        Ok(Self::with_entries(config, Some(path), entries))
    }

    fn with_entries(
        config: CacheConfig,
        path: Option<PathBuf>,
        entries: HashMap<String, CacheEntry>,
    ) -> Self {
        Self {
            config,
            path,
            entries: Mutex::new(entries),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, now_millis()).await
    }

    /// Lookup at an explicit time. Expired rows are reported as misses but
    /// left in place for the sweep.
    pub async fn get_at(&self, key: &str, now: u64) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.access_count += 1;
                entry.last_accessed_at = Some(now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cache_lookups_total", "result" => "hit").increment(1);
                debug!(key, category = %entry.category, "cache hit");
                Some(entry.payload.clone())
            }
            Some(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cache_lookups_total", "result" => "expired").increment(1);
                debug!(key, "cache entry expired");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cache_lookups_total", "result" => "miss").increment(1);
                None
            }
        }
    }

    /// Typed lookup. A payload that no longer deserializes is treated as a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key, error = %e, "cached payload has unexpected shape");
                None
            }
        }
    }

    /// Store `value` under `key`. `ttl` overrides the category TTL.
    pub async fn set(
        &self,
        key: &str,
        category: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.set_at(key, category, value, ttl, now_millis()).await
    }

    pub async fn set_at(
        &self,
        key: &str,
        category: &str,
        value: Value,
        ttl: Option<Duration>,
        now: u64,
    ) -> Result<()> {
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(category));
        let entry = CacheEntry {
            key: key.to_string(),
            category: category.to_string(),
            payload: value,
            created_at: now,
            expires_at: now.saturating_add(millis(ttl)),
            access_count: 0,
            last_accessed_at: None,
        };
        let sweep = self.should_sweep();
        let mut entries = self.entries.lock().await;
        let swept = self
            .commit(&mut entries, |table| {
                table.insert(key.to_string(), entry);
                let swept = if sweep { remove_expired(table, now) } else { 0 };
                (swept, true)
            })
            .await?;
        debug!(key, category, ttl_secs = ttl.as_secs(), "cache store");
        if swept > 0 {
            debug!(swept, "opportunistic cache sweep");
        }
        Ok(())
    }

    /// Drop entries by key, category, or all. Returns how many were removed.
    pub async fn invalidate(&self, scope: Invalidation) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let removed = self
            .commit(&mut entries, |table| {
                let before = table.len();
                match &scope {
                    Invalidation::Key(key) => {
                        table.remove(key);
                    }
                    Invalidation::Category(category) => table.retain(|_, e| &e.category != category),
                    Invalidation::All => table.clear(),
                }
                let removed = before - table.len();
                (removed, removed > 0)
            })
            .await?;
        info!(scope = ?scope, removed, "cache invalidated");
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.purge_expired_at(now_millis()).await
    }

    pub async fn purge_expired_at(&self, now: u64) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let removed = self
            .commit(&mut entries, |table| {
                let removed = remove_expired(table, now);
                (removed, removed > 0)
            })
            .await?;
        if removed > 0 {
            debug!(removed, "purged expired cache entries");
        }
        Ok(removed)
    }

    /// Return the cached value for `key`, or run `fetch` and cache its result.
    ///
    /// Fetch errors are returned untouched and nothing is stored. Failing to
    /// persist a fresh result is logged; the caller still gets the value.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        category: &str,
        fetch: F,
    ) -> std::result::Result<Fetched, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Fetched {
                value,
                from_cache: true,
            });
        }

        let value = fetch().await?;
        if let Err(e) = self.set(key, category, value.clone(), None).await {
            warn!(key, category, error = %e, "failed to store fetched response");
        }
        Ok(Fetched {
            value,
            from_cache: false,
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Full entry including access metadata.
    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await;
        let now = now_millis();
        let mut by_category = BTreeMap::new();
        for entry in entries.values() {
            *by_category.entry(entry.category.clone()).or_insert(0) += 1;
        }
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: entries.len(),
            expired: entries.values().filter(|e| e.is_expired_at(now)).count(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            by_category,
            persistent: self.path.is_some(),
        }
    }

    fn should_sweep(&self) -> bool {
        let p = self.config.sweep_probability;
        if p <= 0.0 {
            false
        } else if p >= 1.0 {
            true
        } else {
            rand::rng().random_bool(p)
        }
    }

    /// Apply `mutate` to the table. With a backing file the change is made
    /// on a copy and only swapped in once the copy is on disk, so a failed
    /// write leaves memory as it was. `mutate` reports whether it changed
    /// anything worth writing.
    async fn commit<T>(
        &self,
        entries: &mut HashMap<String, CacheEntry>,
        mutate: impl FnOnce(&mut HashMap<String, CacheEntry>) -> (T, bool),
    ) -> Result<T> {
        let Some(path) = &self.path else {
            return Ok(mutate(entries).0);
        };
        let mut next = entries.clone();
        let (out, changed) = mutate(&mut next);
        if changed {
            persist::write_atomic(path, &next).await?;
            *entries = next;
        }
        Ok(out)
    }
}

fn remove_expired(entries: &mut HashMap<String, CacheEntry>, now: u64) -> usize {
    let before = entries.len();
    entries.retain(|_, e| !e.is_expired_at(now));
    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKey;
    use serde_json::json;

    const T0: u64 = 1_700_000_000_000;

    fn cache() -> ResponseCache {
        ResponseCache::in_memory(
            CacheConfig::default()
                .with_category("domain_metrics", Duration::from_secs(60))
                .with_sweep_probability(0.0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn set_then_get_until_ttl() {
        let cache = cache();
        cache
            .set_at("k", "domain_metrics", json!({"da": 42}), None, T0)
            .await
            .unwrap();

        assert_eq!(cache.get_at("k", T0 + 59_999).await, Some(json!({"da": 42})));
        assert_eq!(cache.get_at("k", T0 + 60_000).await, None);
        // Lazy expiry: the row stays until a sweep.
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn ttl_override_wins_over_category() {
        let cache = cache();
        cache
            .set_at("k", "domain_metrics", json!(1), Some(Duration::from_secs(5)), T0)
            .await
            .unwrap();
        assert_eq!(cache.get_at("k", T0 + 5_000).await, None);
    }

    #[tokio::test]
    async fn hits_update_access_metadata() {
        let cache = cache();
        cache.set_at("k", "other", json!("v"), None, T0).await.unwrap();
        cache.get_at("k", T0 + 10).await;
        cache.get_at("k", T0 + 20).await;
        cache.get_at("missing", T0 + 20).await;

        let entry = cache.entry("k").await.unwrap();
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_accessed_at, Some(T0 + 20));
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[tokio::test]
    async fn sweep_on_set_removes_expired_rows() {
        let cache = ResponseCache::in_memory(CacheConfig::default().with_sweep_probability(1.0)).unwrap();
        cache
            .set_at("old", "c", json!(1), Some(Duration::from_secs(1)), T0)
            .await
            .unwrap();
        cache.set_at("new", "c", json!(2), None, T0 + 2_000).await.unwrap();

        assert!(cache.entry("old").await.is_none());
        assert!(cache.entry("new").await.is_some());
    }

    #[tokio::test]
    async fn purge_expired_counts_removed() {
        let cache = cache();
        cache
            .set_at("a", "c", json!(1), Some(Duration::from_secs(1)), T0)
            .await
            .unwrap();
        cache.set_at("b", "c", json!(2), None, T0).await.unwrap();
        assert_eq!(cache.purge_expired_at(T0 + 1_000).await.unwrap(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn invalidate_by_key_category_and_all() {
        let cache = cache();
        for (key, category) in [("a", "whois"), ("b", "whois"), ("c", "metrics"), ("d", "metrics")] {
            cache.set(key, category, json!(key), None).await.unwrap();
        }

        assert_eq!(cache.invalidate(Invalidation::Key("a".into())).await.unwrap(), 1);
        assert_eq!(cache.invalidate(Invalidation::Category("metrics".into())).await.unwrap(), 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.invalidate(Invalidation::All).await.unwrap(), 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn get_as_deserializes_payload() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Metrics {
            da: u32,
        }
        let cache = cache();
        cache.set("k", "c", json!({"da": 7}), None).await.unwrap();
        assert_eq!(cache.get_as::<Metrics>("k").await, Some(Metrics { da: 7 }));
        assert_eq!(cache.get_as::<Vec<u8>>("k").await, None);
    }

    #[tokio::test]
    async fn get_or_fetch_calls_upstream_once() {
        let cache = cache();
        let key = CacheKey::derive("domain_search", "example.com", &json!({"limit": 5}));
        let counter = AtomicU64::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let fetched = cache
                .get_or_fetch(key.as_str(), "domain_search", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(json!(["a@example.com"]))
                })
                .await
                .unwrap();
            assert_eq!(fetched.value, json!(["a@example.com"]));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_fetch_does_not_cache_errors() {
        let cache = cache();
        let result = cache
            .get_or_fetch("k", "c", || async { Err::<Value, _>("upstream 502") })
            .await;
        assert_eq!(result.unwrap_err(), "upstream 502");
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn file_backed_cache_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = ResponseCache::load(CacheConfig::default(), path.clone()).await.unwrap();
        assert!(path.exists());
        cache.set("k", "whois", json!({"registrar": "x"}), None).await.unwrap();
        cache
            .set_at("gone", "whois", json!(1), Some(Duration::from_secs(1)), T0)
            .await
            .unwrap();

        let reloaded = ResponseCache::load(CacheConfig::default(), path).await.unwrap();
        assert_eq!(reloaded.get("k").await, Some(json!({"registrar": "x"})));
        assert!(reloaded.entry("gone").await.is_none());
        assert!(reloaded.stats().await.persistent);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("cache");
        std::fs::create_dir(&sub).unwrap();
        let cache = ResponseCache::load(CacheConfig::default(), sub.join("cache.json"))
            .await
            .unwrap();
        cache.set("kept", "whois", json!(1), None).await.unwrap();

        std::fs::remove_dir_all(&sub).unwrap();
        assert!(cache.set("new", "whois", json!(2), None).await.is_err());
        assert!(cache.get("new").await.is_none());
        assert!(cache.invalidate(Invalidation::All).await.is_err());
        assert_eq!(cache.get("kept").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = ResponseCache::in_memory(CacheConfig::default().with_sweep_probability(-0.1));
        assert!(result.is_err());
    }
}
