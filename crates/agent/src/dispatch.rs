//! Function dispatch: registered handlers, argument validation, and the
//! resilience guard around every backend call.
//!
//! Every dispatch produces a [`FunctionCallRecord`], failure or not. The
//! orchestrator feeds failed records back into the conversation so the
//! model can route around them; it never sees a raw error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use triago_core::domain::{CallOutcome, FunctionCallRecord};
use triago_core::errors::CallError;
use triago_core::resilience::ResilienceRegistry;
use triago_core::steps::FunctionSpec;
use triago_core::ProcessingContext;

/// Recorded dependency for calls that never matched a handler.
const UNREGISTERED: &str = "unregistered";

/// One executable backend operation. Handlers read system-owned context
/// fields (sender address, ticket id) directly so the model cannot
/// redirect a reply or a note by mistyping them.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Breaker key for the backend this handler talks to.
    fn dependency(&self) -> &'static str;

    async fn invoke(
        &self,
        context: &ProcessingContext,
        arguments: &Value,
    ) -> Result<Value, CallError>;
}

pub struct FunctionDispatcher {
    handlers: HashMap<&'static str, Arc<dyn FunctionHandler>>,
    resilience: Arc<ResilienceRegistry>,
    call_timeout: Duration,
}

impl FunctionDispatcher {
    pub fn new(resilience: Arc<ResilienceRegistry>, call_timeout: Duration) -> Self {
        Self { handlers: HashMap::new(), resilience, call_timeout }
    }

    pub fn register(&mut self, handler: Arc<dyn FunctionHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs one declared function call end to end: handler lookup,
    /// required-argument validation, then the retried-and-breakered
    /// backend call. Validation failures and missing handlers are
    /// recorded with zero attempts since nothing was dispatched.
    pub async fn execute(
        &self,
        spec: &FunctionSpec,
        context: &ProcessingContext,
        arguments: Value,
    ) -> FunctionCallRecord {
        let invoked_at = Utc::now();
        let started = tokio::time::Instant::now();

        let Some(handler) = self.handlers.get(spec.name.as_str()) else {
            let error = CallError::UnknownFunction { name: spec.name.clone() };
            return self.undispatched(spec, arguments, invoked_at, UNREGISTERED, error);
        };
        let dependency = handler.dependency();

        if let Err(error) = spec.validate_arguments(&arguments) {
            return self.undispatched(spec, arguments, invoked_at, dependency, error);
        }

        debug!(
            event_name = "dispatch.function.arguments",
            correlation_id = %context.correlation_id,
            function = %spec.name,
            arguments = %arguments,
            "dispatching function call"
        );

        let call_timeout = self.call_timeout;
        let policy = self.resilience.for_dependency(dependency);
        let outcome = policy
            .execute(|| {
                let handler = Arc::clone(handler);
                let arguments = &arguments;
                async move {
                    match tokio::time::timeout(call_timeout, handler.invoke(context, arguments))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(CallError::Timeout {
                            dependency: dependency.to_owned(),
                            timeout: call_timeout,
                        }),
                    }
                }
            })
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let recorded = match outcome.result {
            Ok(result) => {
                info!(
                    event_name = "dispatch.function.completed",
                    correlation_id = %context.correlation_id,
                    function = %spec.name,
                    dependency,
                    attempts = outcome.attempts,
                    duration_ms,
                    "function call succeeded"
                );
                CallOutcome::Success { result }
            }
            Err(error) => {
                warn!(
                    event_name = "dispatch.function.failed",
                    correlation_id = %context.correlation_id,
                    function = %spec.name,
                    dependency,
                    attempts = outcome.attempts,
                    duration_ms,
                    error_class = error.class(),
                    "function call failed"
                );
                failure_outcome(&error)
            }
        };

        FunctionCallRecord {
            function: spec.name.clone(),
            dependency: dependency.to_owned(),
            arguments,
            outcome: recorded,
            invoked_at,
            duration_ms,
            attempts: outcome.attempts,
        }
    }

    fn undispatched(
        &self,
        spec: &FunctionSpec,
        arguments: Value,
        invoked_at: chrono::DateTime<Utc>,
        dependency: &str,
        error: CallError,
    ) -> FunctionCallRecord {
        warn!(
            event_name = "dispatch.function.rejected",
            function = %spec.name,
            error_class = error.class(),
            "function call rejected before dispatch"
        );
        FunctionCallRecord {
            function: spec.name.clone(),
            dependency: dependency.to_owned(),
            arguments,
            outcome: failure_outcome(&error),
            invoked_at,
            duration_ms: 0,
            attempts: 0,
        }
    }
}

fn failure_outcome(error: &CallError) -> CallOutcome {
    CallOutcome::Failure {
        class: error.class().to_owned(),
        kind: error.kind(),
        message: error.to_string(),
    }
}
