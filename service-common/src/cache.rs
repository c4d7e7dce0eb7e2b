//! Concurrent in-memory cache with per-entry expiry.
//!
//! Reads share a lock; inserts, sweeps and removals take it exclusively.
//! Expiry is checked on every read, so an entry past its deadline is never
//! returned even if no sweep has run yet. Writes that push the table past
//! the configured threshold sweep inline, so the cache stays bounded under
//! bursty write load without a timer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::error::PlatformError;
use crate::metrics::CacheStats;
use crate::sweeper::Sweeper;

/// TTL cache configuration.
#[derive(Debug, Clone)]
pub struct TtlCacheConfig {
    /// Name used for metrics and logs
    pub name: String,
    /// TTL used by [`TtlCache::insert`]
    pub default_ttl: Duration,
    /// Entry count above which a write sweeps inline
    pub sweep_threshold: usize,
}

impl Default for TtlCacheConfig {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            default_ttl: Duration::from_secs(300),
            sweep_threshold: 1000,
        }
    }
}

impl TtlCacheConfig {
    /// Set the cache name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the default TTL.
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the inline sweep threshold.
    #[must_use]
    pub const fn with_sweep_threshold(mut self, threshold: usize) -> Self {
        self.sweep_threshold = threshold;
        self
    }
}

struct Entry<V> {
    value: V,
    // None when the TTL does not fit in an Instant; such entries never expire
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Concurrent string-keyed cache with per-entry expiry.
pub struct TtlCache<V> {
    config: TtlCacheConfig,
    entries: RwLock<HashMap<String, Entry<V>>>,
    stats: CacheStats,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<V> std::fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("config", &self.config)
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: TtlCacheConfig) -> Self {
        let stats = CacheStats::new(&config.name);
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            stats,
            sweeper: Mutex::new(None),
        }
    }

    /// Create an empty cache with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(TtlCacheConfig::default())
    }

    /// Live value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                self.stats.record_hit();
                Some(entry.value.clone())
            }
            _ => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: now.checked_add(ttl),
            },
        );

        if entries.len() > self.config.sweep_threshold {
            let removed = self.sweep_locked(&mut entries, now);
            debug!(cache = %self.config.name, removed, "Inline sweep after threshold");
        }
    }

    /// Store `value` under `key` for the default TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.config.default_ttl);
    }

    /// Return the live value for `key`, or store and return `make()`.
    pub fn get_or_insert_with<F>(&self, key: &str, ttl: Duration, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = make();
        self.set(key, value.clone(), ttl);
        value
    }

    /// Remove every expired entry; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        self.sweep_locked(&mut entries, now)
    }

    fn sweep_locked(&self, entries: &mut HashMap<String, Entry<V>>, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();
        self.stats.evictions.inc_by(removed as u64);
        removed
    }

    /// Remove `key`; returns whether an entry was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Whether `key` has a live entry.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Remaining lifetime of the live entry for `key`.
    ///
    /// An entry that never expires reports [`Duration::MAX`].
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| {
                entry
                    .expires_at
                    .map_or(Duration::MAX, |expires_at| expires_at - now)
            })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Hit, miss and eviction counters.
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Cache configuration.
    pub const fn config(&self) -> &TtlCacheConfig {
        &self.config
    }

    /// Sweep expired entries every `interval` in the background.
    ///
    /// A second call while a sweeper is running does nothing. The task holds
    /// only a weak reference, so dropping the last `Arc` ends it.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a Tokio runtime.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> Result<(), PlatformError> {
        let mut slot = self.sweeper.lock();
        if slot.as_ref().is_some_and(Sweeper::is_running) {
            return Ok(());
        }

        let cache: Weak<Self> = Arc::downgrade(self);
        let sweeper = Sweeper::spawn(format!("{}-sweeper", self.config.name), interval, move || {
            if let Some(cache) = cache.upgrade() {
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(cache = %cache.config.name, removed, "Swept expired entries");
                }
            }
        })?;
        *slot = Some(sweeper);
        Ok(())
    }

    /// Stop the background sweeper. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TtlCache<String> {
        TtlCache::new(TtlCacheConfig::default().with_name("test"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_before_and_after_ttl() {
        let cache = cache();
        cache.set("k", "v".to_string(), Duration::from_secs(10));
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k"), None);
        assert!(!cache.contains("k"));
        assert_eq!(cache.stats().hits.get(), 1);
        assert_eq!(cache.stats().misses.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_refreshes_expiry() {
        let cache = cache();
        cache.set("k", "old".to_string(), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(4)).await;
        cache.set("k", "new".to_string(), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(cache.get("k").as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let cache = cache();
        cache.set("short", "a".to_string(), Duration::from_secs(1));
        cache.set("long", "b".to_string(), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_inline_sweep() {
        let cache: TtlCache<u32> =
            TtlCache::new(TtlCacheConfig::default().with_sweep_threshold(3));
        for i in 0..3 {
            cache.set(format!("k{i}"), i, Duration::from_secs(1));
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.set("fresh", 9, Duration::from_secs(60));
        assert_eq!(cache.stats().evictions.get(), 3);
        assert_eq!(cache.keys(""), vec!["fresh".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_reports_remaining() {
        let cache = cache();
        cache.set("k", "v".to_string(), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(cache.ttl("k"), Some(Duration::from_secs(7)));
        assert_eq!(cache.ttl("missing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_ttl_never_expires() {
        let cache = cache();
        cache.set("forever", "v".to_string(), Duration::MAX);

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(cache.get("forever").as_deref(), Some("v"));
        assert_eq!(cache.ttl("forever"), Some(Duration::MAX));
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_keys_apply_prefix() {
        let cache = cache();
        cache.insert("user:1", "a".to_string());
        cache.insert("user:2", "b".to_string());
        cache.insert("order:1", "c".to_string());

        assert_eq!(cache.keys("user:"), vec!["user:1".to_string(), "user:2".to_string()]);
        assert_eq!(cache.keys("order:").len(), 1);
        assert_eq!(cache.keys("").len(), 3);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = cache();
        cache.insert("a", "1".to_string());
        cache.insert("b", "2".to_string());

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_or_insert_with_computes_once() {
        let cache = cache();
        let mut calls = 0;
        for _ in 0..3 {
            let value = cache.get_or_insert_with("k", Duration::from_secs(60), || {
                calls += 1;
                "computed".to_string()
            });
            assert_eq!(value, "computed");
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let cache = Arc::new(cache());
        cache.set("k", "v".to_string(), Duration::from_secs(1));
        cache.start_sweeper(Duration::from_secs(5)).expect("runtime present");
        cache.start_sweeper(Duration::from_secs(5)).expect("second start is a no-op");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.stats().evictions.get(), 1);

        cache.stop();
        cache.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access() {
        let cache = Arc::new(TtlCache::<u64>::with_defaults());
        let mut handles = Vec::new();

        for task in 0..16u64 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                for i in 0..100u64 {
                    let key = format!("k{}", i % 10);
                    cache.set(key.clone(), task, Duration::from_secs(60));
                    assert!(cache.get(&key).is_some());
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(cache.len(), 10);
    }
}
