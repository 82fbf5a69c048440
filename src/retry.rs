//! Transient-failure retry wrapper.
//!
//! Wraps individual store calls where a blind retry is safe: the order
//! header upsert (idempotent by primary key) and settings/options reads.
//! Deliberately not used around the item/job/payment writes, where a
//! partial success mid-retry would be worse than surfacing one failed
//! attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            retries: 3,
            base_delay: Duration::from_millis(600),
        }
    }
}

/// Run `op`, retrying transient network-class failures with linearly
/// increasing backoff (`base_delay x attempt`). Non-transient errors and
/// exhaustion re-raise the last error immediately.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    options: RetryOptions,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let retries = options.retries.max(1);
    for attempt in 1..=retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_transient() || attempt == retries {
                    return Err(err);
                }
                let wait = options.base_delay * attempt;
                warn!(
                    label,
                    attempt,
                    retries,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "transient store error, retrying"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
    // Loop always returns; keep the compiler satisfied without panicking.
    Err(StoreError::Other(format!("{label}: retries exhausted")))
}
