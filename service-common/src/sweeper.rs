//! Cancellable periodic background task.
//!
//! Shared by the TTL cache and the keyed rate limiter for their expiry sweeps.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PlatformError;

/// Handle to a running periodic task.
///
/// Stopping is idempotent and the task is stopped when the handle drops.
#[derive(Debug)]
pub struct Sweeper {
    name: String,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Run `tick` every `interval` on the current Tokio runtime.
    ///
    /// The first run happens one full interval after spawning.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Internal`] when called outside a Tokio runtime.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut tick: F) -> Result<Self, PlatformError>
    where
        F: FnMut() + Send + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|e| PlatformError::internal(format!("no runtime for sweeper: {e}")))?;
        let name = name.into();
        let token = CancellationToken::new();
        let period = interval.max(Duration::from_millis(1));

        let task_token = token.clone();
        let task_name = name.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval yields immediately on its first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => tick(),
                }
            }
            debug!(task = %task_name, "Sweeper stopped");
        });

        debug!(task = %name, ?period, "Sweeper started");
        Ok(Self {
            name,
            token,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the task. Safe to call any number of times.
    pub fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            debug!(task = %self.name(), "Sweeper stop requested");
        }
    }

    /// Whether [`stop`](Self::stop) has not been called yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
