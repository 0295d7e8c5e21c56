//! Outbound-call protection: retry with backoff inside a per-dependency
//! circuit breaker.
//!
//! The composition is structural. [`ResiliencePolicy::execute`] asks the
//! breaker for admission, runs the retry schedule as one composite call,
//! and reports the composite outcome back — so retries never hammer an
//! open circuit, and one retried call is one breaker sample.

pub mod breaker;
pub mod retry;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

pub use breaker::{CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{RetryOutcome, RetryPolicy};

use serde::Serialize;

use crate::errors::CallError;

/// Retry-inside-breaker guard for one named dependency.
pub struct ResiliencePolicy {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ResiliencePolicy {
    pub fn new(
        dependency: impl Into<String>,
        retry: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self { breaker: CircuitBreaker::new(dependency, breaker_config), retry }
    }

    pub fn dependency(&self) -> &str {
        self.breaker.dependency()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Runs one guarded call. A rejection by the breaker comes back as
    /// [`CallError::CircuitOpen`] with zero attempts, meaning the
    /// operation was never dispatched.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => return RetryOutcome { result: Err(rejection), attempts: 0 },
        };
        let outcome = self.retry.execute(self.dependency(), operation).await;
        self.breaker.record(permit, outcome.result.is_ok());
        outcome
    }
}

/// Health-endpoint view of one breaker.
#[derive(Clone, Debug, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Hands out one policy per dependency name, created on first use.
/// Shared across concurrent runs; breaker state carries between them.
pub struct ResilienceRegistry {
    retry: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    policies: Mutex<HashMap<String, Arc<ResiliencePolicy>>>,
}

impl ResilienceRegistry {
    pub fn new(retry: RetryPolicy, breaker_config: CircuitBreakerConfig) -> Self {
        Self { retry, breaker_config, policies: Mutex::new(HashMap::new()) }
    }

    pub fn for_dependency(&self, dependency: &str) -> Arc<ResiliencePolicy> {
        let mut policies =
            self.policies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        policies
            .entry(dependency.to_owned())
            .or_insert_with(|| {
                Arc::new(ResiliencePolicy::new(dependency, self.retry, self.breaker_config))
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let policies = self.policies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshots: Vec<_> = policies
            .values()
            .map(|policy| BreakerSnapshot {
                dependency: policy.dependency().to_owned(),
                state: policy.breaker().state(),
                consecutive_failures: policy.breaker().consecutive_failures(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshots
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::errors::CallError;

    use super::{CircuitBreakerConfig, CircuitState, ResilienceRegistry, RetryPolicy};

    fn transient() -> CallError {
        CallError::Connection { dependency: "email".to_owned(), message: "reset".to_owned() }
    }

    fn small_registry() -> ResilienceRegistry {
        ResilienceRegistry::new(
            RetryPolicy { max_attempts: 2, ..RetryPolicy::default() },
            CircuitBreakerConfig { failure_threshold: 2, cooldown: Duration::from_secs(60) },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn registry_reuses_the_policy_per_dependency() {
        let registry = ResilienceRegistry::default();
        let first = registry.for_dependency("email");
        let second = registry.for_dependency("email");
        let other = registry.for_dependency("ticketing");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn one_retried_call_is_one_breaker_sample() {
        let registry = small_registry();
        let policy = registry.for_dependency("email");
        let calls = Arc::new(AtomicU32::new(0));

        // Two composite failures of two attempts each open the breaker.
        for _ in 0..2 {
            let counter = Arc::clone(&calls);
            let outcome = policy
                .execute(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(transient())
                    }
                })
                .await;
            assert_eq!(outcome.attempts, 2);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(policy.breaker().state(), CircuitState::Open);

        let rejected = policy.execute(|| async { Ok::<_, CallError>(()) }).await;
        assert!(matches!(rejected.result, Err(CallError::CircuitOpen { .. })));
        assert_eq!(rejected.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_the_circuit_again() {
        let registry = small_registry();
        let policy = registry.for_dependency("email");

        for _ in 0..2 {
            let _ = policy.execute(|| async { Err::<(), _>(transient()) }).await;
        }
        assert_eq!(policy.breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        let probe = policy.execute(|| async { Ok::<_, CallError>("pong") }).await;
        assert_eq!(probe.result.expect("probe succeeds"), "pong");
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
    }
}
