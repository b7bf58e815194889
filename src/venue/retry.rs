// =============================================================================
// Bounded retry with exponential backoff and jitter
// =============================================================================
//
// Retryable venue errors get up to `max_attempts` tries; permanent errors
// return immediately. Delay doubles per attempt, clamped, with ±30% jitter to
// avoid synchronised retries across symbols.
// =============================================================================

use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::warn;

use super::VenueError;

/// Retry policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (0-based).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

/// Run `operation` with the retry policy. Permanent errors short-circuit.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let mut last_error: Option<VenueError> = None;

    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max = policy.max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "venue call failed — retrying"
                );
                last_error = Some(e);
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or(VenueError::Network("retry budget exhausted".to_string())))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_delay_ms: 1, max_delay_ms: 2, jitter_factor: 0.0 }
    }

    #[test]
    fn delay_doubles_and_clamps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 300,
            jitter_factor: 0.0,
        };
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(300)); // clamped
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let result = with_retry(&fast_policy(), "test", || async { Ok::<_, VenueError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let result = with_retry(&fast_policy(), "test", || {
            let a = a.clone();
            async move {
                if a.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(VenueError::Network("blip".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let result: Result<(), _> = with_retry(&fast_policy(), "test", || {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(VenueError::Http {
                    status: 400,
                    code: Some(-2019),
                    message: "Margin is insufficient".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let result: Result<(), _> = with_retry(&fast_policy(), "test", || async {
            Err(VenueError::Http { status: 503, code: None, message: "busy".into() })
        })
        .await;
        match result.unwrap_err() {
            VenueError::Http { status, .. } => assert_eq!(status, 503),
            other => panic!("unexpected error: {other}"),
        }
    }
}
