//! Token bucket.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket holding up to `burst` tokens, refilled at `rate` tokens per second.
///
/// Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        self.try_acquire().is_ok()
    }

    /// Take one token, or report how long until one is available.
    ///
    /// # Errors
    ///
    /// Returns the wait until the next token when the bucket is empty.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - state.tokens;
        let wait = if self.rate > 0.0 {
            Duration::try_from_secs_f64(missing / self.rate).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        Err(wait)
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Refill rate in tokens per second.
    #[must_use]
    pub const fn rate(&self) -> f64 {
        self.rate
    }

    /// Capacity.
    #[must_use]
    pub const fn burst(&self) -> u32 {
        self.burst
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = elapsed
            .mul_add(self.rate, state.tokens)
            .min(f64::from(self.burst));
        state.last_refill = now;
    }
}
