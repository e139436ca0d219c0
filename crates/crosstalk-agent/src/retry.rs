//! Jittered backoff for transient transport failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::AgentError;

pub const DEFAULT_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 8_000;

/// Exponential backoff with full jitter: attempt `n` (0-based) sleeps a
/// uniform random duration in `[0, min(base * 2^n, max))`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ceiling = BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(MAX_DELAY_MS);
    let ms = rand::rng().random_range(0..=ceiling);
    Duration::from_millis(ms)
}

/// Run `op` up to `attempts` times, retrying only transient failures.
/// Non-transient errors and successes return immediately.
pub async fn retry_transient<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = backoff_delay(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient agent failure, retrying");
                tokio::time::sleep(delay).await;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| AgentError::Other("retry loop exhausted".to_string())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), AgentError> = retry_transient(3, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::Transient("503".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), AgentError> = retry_transient(3, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::ContextOverflow("too long".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(AgentError::ContextOverflow(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transient_returns_ok() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = retry_transient(3, move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AgentError::Transient("429".into()))
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_stays_under_ceiling() {
        for attempt in 0..10 {
            let d = backoff_delay(attempt);
            assert!(d <= Duration::from_millis(MAX_DELAY_MS));
        }
    }
}
