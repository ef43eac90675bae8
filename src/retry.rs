//! Async retry utilities with exponential backoff.
//!
//! Grounded on `server/src/utils/retry.rs`. Not used internally by the poll
//! loop or by any engine operation — §7's propagation policy is explicit
//! that transient store errors are surfaced to the caller's error channel
//! and retried only by the loop's next natural iteration, never retried
//! internally. This module is exposed for callers who want bounded retry
//! semantics around their own operations (e.g. an initial [`crate::Client::connect`]
//! during startup, before any topic exists to retry against).

use std::time::Duration;

/// Retry an async operation up to `max_attempts` times, doubling the delay
/// after each failure starting from `base_delay_ms`.
///
/// Returns `Ok(attempts)` on success, or `Err((error, attempts))` once
/// `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    max_attempts: u32,
    base_delay_ms: u64,
    mut operation: F,
) -> Result<(T, u32), (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok((value, attempts)),
            Err(e) => {
                if attempts >= max_attempts {
                    return Err((e, attempts));
                }
                let delay = Duration::from_millis(base_delay_ms * 2_u64.pow(attempts - 1));
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let result = retry_with_backoff(3, 1, || async { Ok::<_, &str>(42) }).await;
        assert_eq!(result, Ok((42, 1)));
    }

    #[tokio::test]
    async fn succeeds_after_retry() {
        let attempts = RefCell::new(0);
        let result = retry_with_backoff(3, 1, || {
            let mut a = attempts.borrow_mut();
            *a += 1;
            let current = *a;
            async move {
                if current < 2 {
                    Err("transient")
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(result, Ok(((), 2)));
    }

    #[tokio::test]
    async fn fails_after_max_attempts() {
        let result = retry_with_backoff(3, 1, || async { Err::<(), _>("persistent") }).await;
        let (error, attempts) = result.unwrap_err();
        assert_eq!(error, "persistent");
        assert_eq!(attempts, 3);
    }
}
