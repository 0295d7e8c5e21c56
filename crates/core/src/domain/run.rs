use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::ticket::TicketId;
use crate::domain::warranty::WarrantyStatus;
use crate::errors::FailureKind;
use crate::steps::StepName;

/// Failure reason when a send-declaring path reached DONE with no
/// delivered reply.
pub const REASON_REPLY_NOT_SENT: &str = "reply_not_sent";
/// Failure reason for runs abandoned during shutdown.
pub const REASON_INCOMPLETE: &str = "incomplete";
/// Halt reason for the verified agent-disabled opt-out.
pub const HALT_AGENT_DISABLED: &str = "agent_disabled";

/// One dispatched function call, kept whether it succeeded or failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRecord {
    pub function: String,
    pub dependency: String,
    pub arguments: Value,
    pub outcome: CallOutcome,
    pub invoked_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Success { result: Value },
    Failure { class: String, kind: FailureKind, message: String },
}

impl FunctionCallRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, CallOutcome::Success { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            CallOutcome::Success { result } => Some(result),
            CallOutcome::Failure { .. } => None,
        }
    }
}

/// Failure step and reason travel together or not at all.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step: StepName,
    pub reason: String,
}

/// Aggregated outcome of one run. This is the only thing `run` returns;
/// abnormal paths land here instead of escaping as errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub correlation_id: Uuid,
    /// Steps visited in order, entry step first.
    pub path: Vec<StepName>,
    /// The step that was active when the run ended.
    pub final_step: StepName,
    pub serial_number: Option<String>,
    pub warranty_status: Option<WarrantyStatus>,
    pub reply_sent: bool,
    pub ticket_id: Option<TicketId>,
    pub elapsed_ms: u64,
    /// Populated on successful halts that skipped the reply on purpose.
    pub halt_reason: Option<String>,
    pub failure: Option<RunFailure>,
    pub records: Vec<FunctionCallRecord>,
}

impl ProcessingResult {
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_ref().map(|failure| failure.reason.as_str())
    }

    pub fn failure_step(&self) -> Option<&StepName> {
        self.failure.as_ref().map(|failure| &failure.step)
    }
}
