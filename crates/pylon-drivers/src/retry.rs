//! Retry with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

const BACKOFF_MIN: Duration = Duration::from_millis(8);
const BACKOFF_MAX: Duration = Duration::from_millis(512);

/// Delay before retry number `attempt` (1-based).
pub fn backoff(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    BACKOFF_MIN.saturating_mul(1 << shift).min(BACKOFF_MAX)
}

/// Run `call` until it succeeds, fails with an error `retryable` rejects, or
/// `max_retries` retries have been spent.
pub async fn with_retries<T, E, F, Fut>(
    max_retries: u32,
    retryable: impl Fn(&E) -> bool,
    mut call: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(err) if attempt < max_retries && retryable(&err) => {
                attempt += 1;
                debug!(attempt, error = %err, "retrying");
                tokio::time::sleep(backoff(attempt)).await;
            }
            result => return result,
        }
    }
}
