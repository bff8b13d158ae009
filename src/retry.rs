//! Bounded external calls
//!
//! Every call to a venue or feed goes through `with_timeout`, and the
//! retryable ones through `retry_async` (exponential backoff).

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::providers::ProviderError;

/// Run `fut`, mapping an elapsed timer to `ProviderError::Timeout(op)`.
pub async fn with_timeout<T, F>(op: &str, limit: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(ProviderError::Timeout(op.to_string())),
    }
}

/// Retry an async operation with exponential backoff.
///
/// `op` receives the 1-based attempt number. `Rejected` errors are final and
/// returned immediately; timeouts and unavailability are retried.
pub async fn retry_async<F, Fut, T>(
    mut op: F,
    attempts: usize,
    initial_delay: Duration,
) -> Result<T, ProviderError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(ProviderError::Rejected(msg)) => return Err(ProviderError::Rejected(msg)),
            Err(e) if attempt < attempts => {
                debug!(attempt = attempt, error = %e, "Provider call failed, backing off");
                sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
