//! Keyed rate limiter
//!
//! One independent token bucket per caller key (usually the client IP),
//! created lazily on first sight and evicted after `ttl` without access.
//! The key table is read-mostly: the hot path takes the shared lock and only
//! first-time keys take the exclusive one.

mod bucket;

pub use bucket::TokenBucket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::error::PlatformError;
use crate::metrics::LimiterMetrics;
use crate::sweeper::Sweeper;

/// Rate limit decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request allowed
    Allowed,
    /// Request denied with retry-after duration
    Denied {
        /// Wait until the next token
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    /// Whether the request may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Rate limit configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Name used for metrics and logs
    pub name: String,
    /// Sustained requests per second per key
    pub rate: f64,
    /// Bucket capacity per key
    pub burst: u32,
    /// Idle time after which a key is evicted
    pub ttl: Duration,
    /// Interval between background sweeps
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            name: "rate_limiter".to_string(),
            rate: 10.0,
            burst: 20,
            ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl RateLimitConfig {
    /// Set the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set rate and burst.
    #[must_use]
    pub const fn with_rate(mut self, rate: f64, burst: u32) -> Self {
        self.rate = rate;
        self.burst = burst;
        self
    }

    /// Set the idle TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the sweep interval.
    #[must_use]
    pub const fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] for a non-positive rate, a zero
    /// burst or zero durations.
    pub fn validate(&self) -> Result<(), PlatformError> {
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(PlatformError::invalid_input("rate must be positive"));
        }
        if self.burst == 0 {
            return Err(PlatformError::invalid_input("burst must be at least 1"));
        }
        if self.ttl.is_zero() || self.cleanup_interval.is_zero() {
            return Err(PlatformError::invalid_input(
                "ttl and cleanup interval must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LimiterEntry {
    bucket: Arc<TokenBucket>,
    // milliseconds since the limiter's origin
    last_seen: AtomicU64,
}

impl LimiterEntry {
    fn touch(&self, now_ms: u64) {
        self.last_seen.fetch_max(now_ms, Ordering::Relaxed);
    }
}

/// Per-key token bucket limiter.
#[derive(Debug)]
pub struct KeyedRateLimiter {
    config: RateLimitConfig,
    origin: Instant,
    entries: RwLock<HashMap<String, Arc<LimiterEntry>>>,
    metrics: LimiterMetrics,
    sweeper: Mutex<Option<Sweeper>>,
}

impl KeyedRateLimiter {
    /// Create a limiter. No background sweep runs until [`start`](Self::start).
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let metrics = LimiterMetrics::new(&config.name);
        Self {
            config,
            origin: Instant::now(),
            entries: RwLock::new(HashMap::new()),
            metrics,
            sweeper: Mutex::new(None),
        }
    }

    /// Create a limiter with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Create a limiter and start its background sweep.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a Tokio runtime.
    pub fn spawn(config: RateLimitConfig) -> Result<Arc<Self>, PlatformError> {
        let limiter = Arc::new(Self::new(config));
        limiter.start()?;
        Ok(limiter)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Bucket for `key`, created on first use.
    ///
    /// Concurrent first-time callers for the same key all receive the same
    /// bucket.
    pub fn get_or_create(&self, key: &str) -> Arc<TokenBucket> {
        let now_ms = self.now_ms();

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                entry.touch(now_ms);
                return Arc::clone(&entry.bucket);
            }
        }

        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            Arc::new(LimiterEntry {
                bucket: Arc::new(TokenBucket::new(self.config.rate, self.config.burst)),
                last_seen: AtomicU64::new(now_ms),
            })
        });
        entry.touch(now_ms);
        let bucket = Arc::clone(&entry.bucket);
        self.metrics.tracked_keys.set(entries.len() as u64);
        bucket
    }

    /// Consume one token for `key`.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        match self.get_or_create(key).try_acquire() {
            Ok(()) => {
                self.metrics.allowed.inc();
                RateLimitDecision::Allowed
            }
            Err(retry_after) => {
                self.metrics.rejected.inc();
                debug!(limiter = %self.config.name, key, ?retry_after, "Rate limit exceeded");
                RateLimitDecision::Denied { retry_after }
            }
        }
    }

    /// Shorthand for `check(key).is_allowed()`.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    /// Remove keys idle for longer than the TTL; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now_ms = self.now_ms();
        let ttl_ms = u64::try_from(self.config.ttl.as_millis()).unwrap_or(u64::MAX);

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            now_ms.saturating_sub(entry.last_seen.load(Ordering::Relaxed)) <= ttl_ms
        });
        let removed = before - entries.len();
        self.metrics.tracked_keys.set(entries.len() as u64);
        removed
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Tracked keys starting with `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.metrics.tracked_keys.set(0);
    }

    /// Allowed/rejected counters and the tracked-keys gauge.
    pub const fn metrics(&self) -> &LimiterMetrics {
        &self.metrics
    }

    /// Limiter configuration.
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Start the background sweep on `cleanup_interval`.
    ///
    /// A second call while running does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), PlatformError> {
        let mut slot = self.sweeper.lock();
        if slot.as_ref().is_some_and(Sweeper::is_running) {
            return Ok(());
        }

        let limiter: Weak<Self> = Arc::downgrade(self);
        let sweeper = Sweeper::spawn(
            format!("{}-sweeper", self.config.name),
            self.config.cleanup_interval,
            move || {
                if let Some(limiter) = limiter.upgrade() {
                    let removed = limiter.sweep();
                    if removed > 0 {
                        debug!(limiter = %limiter.config.name, removed, "Evicted idle keys");
                    }
                }
            },
        )?;
        *slot = Some(sweeper);
        Ok(())
    }

    /// Stop the background sweep. Idempotent.
    pub fn stop(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
    }
}
