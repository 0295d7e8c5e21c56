use std::time::Duration;

use thiserror::Error;

use crate::steps::StepName;

/// Classification that drives retry decisions for outbound calls.
///
/// Transient failures may be retried under the resilience policy;
/// permanent failures never are. Orchestration errors live outside this
/// split entirely (see [`OrchestrationError`]) and always fail a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Failure of a single outbound call (reasoning or backend function).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("call to `{dependency}` timed out after {timeout:?}")]
    Timeout { dependency: String, timeout: Duration },
    #[error("connection to `{dependency}` failed: {message}")]
    Connection { dependency: String, message: String },
    #[error("`{dependency}` rate limited the call: {message}")]
    RateLimited { dependency: String, message: String },
    #[error("`{dependency}` returned server error {status}: {message}")]
    Upstream { dependency: String, status: u16, message: String },
    #[error("`{dependency}` rejected credentials ({status}): {message}")]
    Auth { dependency: String, status: u16, message: String },
    #[error("request rejected as invalid: {message}")]
    Validation { message: String },
    #[error("`{dependency}` has no such resource: {message}")]
    NotFound { dependency: String, message: String },
    #[error("no function registered under `{name}`")]
    UnknownFunction { name: String },
    #[error("circuit open for `{dependency}`; call rejected without dispatch")]
    CircuitOpen { dependency: String },
    #[error("`{dependency}` returned a malformed response: {message}")]
    MalformedResponse { dependency: String, message: String },
}

impl CallError {
    /// Maps an HTTP status from a backend into the call-failure taxonomy.
    pub fn from_status(dependency: &str, status: u16, message: impl Into<String>) -> Self {
        let dependency = dependency.to_owned();
        let message = message.into();
        match status {
            429 => Self::RateLimited { dependency, message },
            401 | 403 => Self::Auth { dependency, status, message },
            404 => Self::NotFound { dependency, message },
            400 | 422 => Self::Validation { message },
            // 5xx and anything unrecognized: treat as an upstream fault
            // and let the retry policy have a go at it.
            _ => Self::Upstream { dependency, status, message },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. }
            | Self::Connection { .. }
            | Self::RateLimited { .. }
            | Self::Upstream { .. } => FailureKind::Transient,
            Self::Auth { .. }
            | Self::Validation { .. }
            | Self::NotFound { .. }
            | Self::UnknownFunction { .. }
            | Self::CircuitOpen { .. }
            | Self::MalformedResponse { .. } => FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Stable token identifying the failure class in logs and records.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Connection { .. } => "connection",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream { .. } => "upstream",
            Self::Auth { .. } => "auth",
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::UnknownFunction { .. } => "unknown_function",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::MalformedResponse { .. } => "malformed_response",
        }
    }
}

/// Errors of the engine itself rather than of any outbound dependency.
///
/// These are never retried and always terminate the run as failed; the
/// orchestrator refuses to guess its way past them.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("step `{step}` is not known to the instruction store")]
    UnknownStep { step: StepName },
    #[error("step `{step}` does not declare function `{function}`")]
    UndeclaredFunction { step: StepName, function: String },
    #[error("step `{step}` ended without a parseable transition directive: {detail}")]
    MissingDirective { step: StepName, detail: String },
    #[error("step `{step}` may not transition to `{target}`")]
    IllegalTransition { step: StepName, target: String },
    #[error("iteration budget of {budget} exhausted while in step `{step}`")]
    IterationBudgetExceeded { step: StepName, budget: u32 },
    #[error("run deadline of {deadline:?} exceeded while in step `{step}`")]
    RunDeadlineExceeded { step: StepName, deadline: Duration },
    #[error("reasoning client unavailable in step `{step}`: {detail}")]
    ReasoningUnavailable { step: StepName, detail: String },
    #[error("agent-disabled halt asserted in step `{step}` without a verifying feature-flag result")]
    AgentDisabledUnverified { step: StepName },
}

impl OrchestrationError {
    pub fn step(&self) -> &StepName {
        match self {
            Self::UnknownStep { step }
            | Self::UndeclaredFunction { step, .. }
            | Self::MissingDirective { step, .. }
            | Self::IllegalTransition { step, .. }
            | Self::IterationBudgetExceeded { step, .. }
            | Self::RunDeadlineExceeded { step, .. }
            | Self::ReasoningUnavailable { step, .. }
            | Self::AgentDisabledUnverified { step } => step,
        }
    }

    /// Stable token recorded as the run's failure reason.
    pub fn reason_token(&self) -> &'static str {
        match self {
            Self::UnknownStep { .. } => "unknown_step",
            Self::UndeclaredFunction { .. } => "undeclared_function",
            Self::MissingDirective { .. } => "missing_directive",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::IterationBudgetExceeded { .. } => "iteration_budget_exceeded",
            Self::RunDeadlineExceeded { .. } => "run_deadline_exceeded",
            Self::ReasoningUnavailable { .. } => "reasoning_unavailable",
            Self::AgentDisabledUnverified { .. } => "agent_disabled_unverified",
        }
    }
}
