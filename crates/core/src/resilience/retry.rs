use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::errors::CallError;

/// Retry schedule for transient outbound failures.
///
/// Permanent failures are returned immediately; only transient ones are
/// retried, with exponential backoff capped at `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Result of a retried call plus how many attempts it took. Zero
/// attempts means the call was rejected before the first dispatch.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, CallError>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Delay applied after the given 1-based attempt fails.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.backoff_multiplier.powi(exponent as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Runs the operation until it succeeds, fails permanently, or the
    /// attempt budget runs out.
    pub async fn execute<T, F, Fut>(&self, dependency: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return RetryOutcome { result: Ok(value), attempts: attempt },
                Err(error) => {
                    if !error.is_transient() || attempt >= self.max_attempts.max(1) {
                        return RetryOutcome { result: Err(error), attempts: attempt };
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        event_name = "resilience.retry.backoff",
                        dependency,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error_class = error.class(),
                        "transient failure, retrying after backoff"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::errors::CallError;

    use super::RetryPolicy;

    fn transient() -> CallError {
        CallError::Connection { dependency: "ticketing".to_owned(), message: "reset".to_owned() }
    }

    fn permanent() -> CallError {
        CallError::Auth { dependency: "ticketing".to_owned(), status: 401, message: "nope".to_owned() }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = RetryPolicy::default()
            .execute("ticketing", move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok("created")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.expect("third attempt succeeds"), "created");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = RetryPolicy::default()
            .execute("ticketing", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(permanent())
                }
            })
            .await;

        assert!(matches!(outcome.result, Err(CallError::Auth { .. })));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_is_exhausted_after_three_tries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = RetryPolicy::default()
            .execute("ticketing", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(transient())
                }
            })
            .await;

        assert!(matches!(outcome.result, Err(CallError::Connection { .. })));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_clock_advances_through_backoff_sleeps() {
        let started = tokio::time::Instant::now();
        let outcome = RetryPolicy::default()
            .execute("ticketing", || async { Err::<(), _>(transient()) })
            .await;

        assert!(outcome.result.is_err());
        // 1s after the first attempt, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }
}
