use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Retry an async fallible operation with exponential backoff.
///
/// Only `Error::Transient` is retried; every other kind is returned
/// immediately. When attempts run out, the last transient error is
/// collapsed to `Fatal` so callers see a terminal kind.
///
/// - `max_attempts`: total attempts (including the first).
/// - `base_delay`: delay after the first failure, doubled on each subsequent failure.
/// - `label`: description for log messages.
pub async fn retry<T, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() => {
                if attempt < max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.expect("at least one attempt ran").into_fatal())
}
