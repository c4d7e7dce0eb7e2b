//! Lightweight in-process metrics with Prometheus text rendering.
//!
//! Each outbound client, TTL cache and rate limiter owns its own metric set;
//! nothing here is process-global.

use std::sync::atomic::{AtomicU64, Ordering};

/// Anything that can render itself as Prometheus exposition text.
pub trait Metric {
    /// Format as Prometheus text.
    fn to_prometheus(&self) -> String;
}

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: String,
    help: String,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by `amount`.
    pub fn inc_by(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Metric for Counter {
    fn to_prometheus(&self) -> String {
        format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
            name = self.name,
            help = self.help,
            value = self.get()
        )
    }
}

/// A value that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: String,
    help: String,
    value: AtomicU64,
}

impl Gauge {
    /// Create a new gauge.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Set the gauge value.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Metric for Gauge {
    fn to_prometheus(&self) -> String {
        format!(
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n",
            name = self.name,
            help = self.help,
            value = self.get()
        )
    }
}

/// Counters kept by an outbound client's retry engine.
#[derive(Debug)]
pub struct ClientMetrics {
    /// Attempts sent, including the first
    pub attempts: Counter,
    /// Attempts that were retries
    pub retries: Counter,
    /// Calls that ended with the exhaustion error
    pub exhausted: Counter,
}

impl ClientMetrics {
    /// Create client metrics named after `service`.
    #[must_use]
    pub fn new(service: &str) -> Self {
        let prefix = sanitize(service);
        Self {
            attempts: Counter::new(
                format!("{prefix}_outbound_attempts_total"),
                "Total number of outbound attempts",
            ),
            retries: Counter::new(
                format!("{prefix}_outbound_retries_total"),
                "Total number of outbound retries",
            ),
            exhausted: Counter::new(
                format!("{prefix}_outbound_exhausted_total"),
                "Total number of calls that exhausted their retry budget",
            ),
        }
    }
}

impl Metric for ClientMetrics {
    fn to_prometheus(&self) -> String {
        render_prometheus(&[&self.attempts, &self.retries, &self.exhausted])
    }
}

/// Hit/miss/eviction counters for a TTL cache.
#[derive(Debug)]
pub struct CacheStats {
    /// Lookups that found a live entry
    pub hits: Counter,
    /// Lookups that found nothing or an expired entry
    pub misses: Counter,
    /// Entries removed by expiry
    pub evictions: Counter,
}

impl CacheStats {
    /// Create cache stats with the given prefix.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        let prefix = sanitize(prefix);
        Self {
            hits: Counter::new(
                format!("{prefix}_cache_hits_total"),
                "Total number of cache hits",
            ),
            misses: Counter::new(
                format!("{prefix}_cache_misses_total"),
                "Total number of cache misses",
            ),
            evictions: Counter::new(
                format!("{prefix}_cache_evictions_total"),
                "Total number of expired entries removed",
            ),
        }
    }

    /// Record a cache hit.
    pub fn record_hit(&self) {
        self.hits.inc();
    }

    /// Record a cache miss.
    pub fn record_miss(&self) {
        self.misses.inc();
    }
}

impl Metric for CacheStats {
    fn to_prometheus(&self) -> String {
        render_prometheus(&[&self.hits, &self.misses, &self.evictions])
    }
}

/// Decision counters for a keyed rate limiter.
#[derive(Debug)]
pub struct LimiterMetrics {
    /// Checks that consumed a token
    pub allowed: Counter,
    /// Checks rejected for lack of tokens
    pub rejected: Counter,
    /// Keys currently tracked
    pub tracked_keys: Gauge,
}

impl LimiterMetrics {
    /// Create limiter metrics with the given prefix.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        let prefix = sanitize(prefix);
        Self {
            allowed: Counter::new(
                format!("{prefix}_rate_limit_allowed_total"),
                "Total number of requests allowed",
            ),
            rejected: Counter::new(
                format!("{prefix}_rate_limit_rejected_total"),
                "Total number of requests rejected",
            ),
            tracked_keys: Gauge::new(
                format!("{prefix}_rate_limit_tracked_keys"),
                "Current number of tracked keys",
            ),
        }
    }
}

impl Metric for LimiterMetrics {
    fn to_prometheus(&self) -> String {
        render_prometheus(&[&self.allowed, &self.rejected, &self.tracked_keys])
    }
}

/// Concatenate the exposition text of every metric.
#[must_use]
pub fn render_prometheus(metrics: &[&dyn Metric]) -> String {
    metrics.iter().map(|metric| metric.to_prometheus()).collect()
}

/// Map a free-form name onto the Prometheus metric-name alphabet.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}
