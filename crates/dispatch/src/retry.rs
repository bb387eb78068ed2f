//! Linear-backoff retry for broker publishes.
//!
//! Only transient errors (connection loss, acquisition timeout) are retried.
//! The `i`-th retry waits `min(interval_start + (i - 1) * interval_step,
//! interval_max)`.

use std::future::Future;
use std::time::Duration;

use fahrplan_core::{FahrplanError, Result, RetryPolicy};
use tracing::warn;

/// Delays before each retry allowed by `policy`. Endless when the policy
/// has no retry limit.
pub fn delays(policy: &RetryPolicy) -> impl Iterator<Item = Duration> + '_ {
    (1u32..)
        .take_while(move |attempt| policy.allows(attempt - 1))
        .map(move |attempt| policy.delay_for_retry(attempt))
}

/// Run `operation` until it succeeds, fails permanently or the retry budget
/// runs out. `operation` receives the 0-based attempt number.
///
/// With `enabled` false the first error is returned unchanged. Exhaustion
/// yields [`FahrplanError::MaxRetriesExceeded`] wrapping the last error.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    enabled: bool,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = delays(policy);
    let mut retries = 0u32;
    loop {
        let err = match operation(retries).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !enabled || !err.is_transient() {
            return Err(err);
        }
        let Some(delay) = delays.next() else {
            return Err(FahrplanError::MaxRetriesExceeded {
                attempts: retries + 1,
                source: Box::new(err),
            });
        };

        retries += 1;
        warn!(
            attempt = retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "publish failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
