//! Bounded polling with backoff.
//!
//! Readiness checks and namespace-deletion waits go through [`poll_until`]
//! so every wait is cancellable and ends in an explicit timeout.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ClusterError;

/// How often and for how long to poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay before the second check.
    pub interval: Duration,
    /// Upper bound for the grown delay.
    pub max_interval: Duration,
    /// Multiplier applied to the delay after every check.
    pub backoff: f64,
    /// Total time budget.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(300),
            max_interval: Duration::from_secs(2),
            backoff: 1.5,
            timeout: Duration::from_secs(300),
        }
    }
}

impl PollPolicy {
    /// Fixed-interval policy.
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            backoff: 1.0,
            timeout,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.backoff.max(1.0);
        Duration::from_secs_f64(grown.min(self.max_interval.as_secs_f64()))
    }
}

/// Run `check` until it yields `Some`, an error, the timeout, or cancellation.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    token: &CancellationToken,
    what: &str,
    mut check: F,
) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ClusterError>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut delay = policy.interval;

    loop {
        if token.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }
        if let Some(value) = check().await? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ClusterError::Timeout(what.to_string()));
        }
        if !sleep_or_cancel(token, delay.min(deadline - now)).await {
            return Err(ClusterError::Cancelled);
        }
        delay = policy.next_delay(delay);
    }
}

/// Sleep for `duration`. Returns `false` if `token` fired first.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
