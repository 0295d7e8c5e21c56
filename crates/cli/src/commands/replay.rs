//! Offline scenario replay.
//!
//! Feeds one scripted message through the real engine: real instruction
//! files, real dispatcher, scripted reasoning replies, and canned
//! backends. Useful for validating a step graph before pointing the
//! server at live dependencies.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use triago_agent::dispatch::FunctionDispatcher;
use triago_agent::functions::register_standard_handlers;
use triago_agent::llm::{FunctionCallRequest, ReasoningReply, ScriptedReasoningClient};
use triago_agent::orchestrator::{EngineSettings, StepOrchestrator};
use triago_core::clients::{EntitlementClient, MessagingClient, TicketingClient};
use triago_core::domain::HALT_AGENT_DISABLED;
use triago_core::errors::CallError;
use triago_core::resilience::{CircuitBreakerConfig, ResilienceRegistry, RetryPolicy};
use triago_core::steps::{FileInstructionStore, StepName};
use triago_core::{
    CallOutcome, InboundMessage, NewTicket, OutboundReply, ProcessingResult, SentReceipt, TicketId,
    WarrantyRecord, WarrantyStatus,
};

use crate::commands::CommandResult;

/// Canned backends answer instantly, so these bounds only matter when a
/// scenario is broken enough to loop.
const FUNCTION_TIMEOUT: Duration = Duration::from_secs(5);
const RUN_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Scenario {
    message: ScenarioMessage,
    #[serde(default)]
    engine: ScenarioEngine,
    #[serde(default)]
    backends: ScenarioBackends,
    #[serde(default)]
    replies: Vec<ScenarioReply>,
    /// When present, the command passes only if every named field
    /// matches the run's result. Without it, pass means a successful
    /// run.
    #[serde(default)]
    expect: Option<ScenarioExpectations>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioMessage {
    message_id: String,
    sender: String,
    subject: String,
    body: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ScenarioEngine {
    entry_step: String,
    max_iterations: u32,
    /// Resolved against the scenario file's directory when relative.
    steps_dir: Option<PathBuf>,
}

impl Default for ScenarioEngine {
    fn default() -> Self {
        Self { entry_step: "extract-identifier".to_string(), max_iterations: 10, steps_dir: None }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ScenarioBackends {
    warranty_status: WarrantyStatus,
    repair_window_hours: Option<u32>,
    ticket_id: i64,
    agent_disabled: bool,
}

impl Default for ScenarioBackends {
    fn default() -> Self {
        Self {
            warranty_status: WarrantyStatus::Valid,
            repair_window_hours: None,
            ticket_id: 4001,
            agent_disabled: false,
        }
    }
}

/// One scripted reasoning reply: either a function call or terminal
/// text carrying the transition directive.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioReply {
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    arguments: Option<toml::Value>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ScenarioExpectations {
    success: Option<bool>,
    reply_sent: Option<bool>,
    path: Option<Vec<String>>,
    final_step: Option<String>,
    failure_reason: Option<String>,
    halt_reason: Option<String>,
    ticket_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ReplayReport<'a> {
    command: &'static str,
    status: &'static str,
    scenario: String,
    summary: String,
    unused_replies: usize,
    unmet_expectations: &'a [String],
    result: &'a ProcessingResult,
}

pub fn run(scenario_path: &Path, steps_override: Option<&Path>) -> CommandResult {
    let scenario = match load_scenario(scenario_path) {
        Ok(scenario) => scenario,
        Err(error) => return CommandResult::failure("replay", "scenario", format!("{error:#}"), 2),
    };

    let Some(steps_dir) = resolve_steps_dir(scenario_path, &scenario, steps_override) else {
        return CommandResult::failure(
            "replay",
            "scenario",
            "scenario names no `engine.steps_dir` and --steps-dir was not given",
            2,
        );
    };

    let entry_step = match StepName::new(&scenario.engine.entry_step) {
        Ok(name) => name,
        Err(error) => return CommandResult::failure("replay", "scenario", error.to_string(), 2),
    };

    let replies = match scripted_replies(&scenario.replies) {
        Ok(replies) => replies,
        Err(error) => return CommandResult::failure("replay", "scenario", format!("{error:#}"), 2),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "replay",
                "runtime",
                format!("failed to initialize async runtime: {error}"),
                4,
            );
        }
    };

    let store = match runtime.block_on(FileInstructionStore::load_dir(&steps_dir)) {
        Ok(store) => store,
        Err(error) => {
            return CommandResult::failure(
                "replay",
                "instruction_set",
                format!("failed to load `{}`: {error}", steps_dir.display()),
                3,
            );
        }
    };

    let reasoning = Arc::new(ScriptedReasoningClient::new(replies.into_iter().map(Ok)));
    let resilience =
        Arc::new(ResilienceRegistry::new(RetryPolicy::default(), CircuitBreakerConfig::default()));

    let mut dispatcher = FunctionDispatcher::new(Arc::clone(&resilience), FUNCTION_TIMEOUT);
    register_standard_handlers(
        &mut dispatcher,
        Arc::new(ReplayEntitlement { record: warranty_record(&scenario.backends) }),
        Arc::new(ReplayTicketing {
            ticket_id: scenario.backends.ticket_id,
            agent_disabled: scenario.backends.agent_disabled,
        }),
        Arc::new(ReplayMessaging { sent: AtomicU32::new(0) }),
    );

    let settings = EngineSettings {
        entry_step,
        max_iterations: scenario.engine.max_iterations,
        run_deadline: RUN_DEADLINE,
    };
    let orchestrator = StepOrchestrator::new(
        Arc::new(store),
        reasoning.clone(),
        dispatcher,
        resilience,
        settings,
    );

    let message = inbound_message(&scenario.message);
    let result = runtime.block_on(orchestrator.run(message));

    let (passed, unmet) = match &scenario.expect {
        Some(expect) => {
            let unmet = unmet_expectations(expect, &result);
            (unmet.is_empty(), unmet)
        }
        None => (result.success, Vec::new()),
    };

    render_report(scenario_path, &result, reasoning.remaining(), passed, &unmet)
}

fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read `{}`", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse `{}`", path.display()))
}

fn resolve_steps_dir(
    scenario_path: &Path,
    scenario: &Scenario,
    explicit: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir.to_path_buf());
    }

    let dir = scenario.engine.steps_dir.as_ref()?;
    if dir.is_absolute() {
        return Some(dir.clone());
    }

    let base = scenario_path.parent().unwrap_or_else(|| Path::new("."));
    Some(base.join(dir))
}

fn scripted_replies(entries: &[ScenarioReply]) -> anyhow::Result<Vec<ReasoningReply>> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| scripted_reply(index, entry))
        .collect()
}

fn scripted_reply(index: usize, entry: &ScenarioReply) -> anyhow::Result<ReasoningReply> {
    match (&entry.function, &entry.text) {
        (Some(function), None) => {
            let arguments = match &entry.arguments {
                Some(value) => serde_json::to_value(value).with_context(|| {
                    format!("reply {index}: arguments are not representable as JSON")
                })?,
                None => Value::Object(serde_json::Map::new()),
            };
            Ok(ReasoningReply::FunctionCall(FunctionCallRequest {
                function: function.clone(),
                arguments,
            }))
        }
        (None, Some(text)) => Ok(ReasoningReply::Text(text.clone())),
        (Some(_), Some(_)) => anyhow::bail!("reply {index} sets both `function` and `text`"),
        (None, None) => anyhow::bail!("reply {index} sets neither `function` nor `text`"),
    }
}

fn warranty_record(backends: &ScenarioBackends) -> WarrantyRecord {
    let expires_at = match backends.warranty_status {
        WarrantyStatus::Valid => Some(Utc::now() + chrono::Duration::days(90)),
        WarrantyStatus::Expired | WarrantyStatus::NotFound => None,
    };
    WarrantyRecord {
        status: backends.warranty_status,
        expires_at,
        repair_window_hours: backends.repair_window_hours,
    }
}

fn inbound_message(message: &ScenarioMessage) -> InboundMessage {
    InboundMessage {
        message_id: message.message_id.clone(),
        sender: message.sender.clone(),
        subject: message.subject.clone(),
        body: message.body.clone(),
        thread_id: message.thread_id.clone(),
        received_at: Utc::now(),
    }
}

/// Collects every expectation the result does not satisfy. Only fields
/// the scenario names are compared, so a failure scenario can assert it
/// fails for the right reason.
fn unmet_expectations(expect: &ScenarioExpectations, result: &ProcessingResult) -> Vec<String> {
    let mut unmet = Vec::new();

    if let Some(success) = expect.success {
        if result.success != success {
            unmet.push(format!("success: expected {success}, got {}", result.success));
        }
    }
    if let Some(reply_sent) = expect.reply_sent {
        if result.reply_sent != reply_sent {
            unmet.push(format!("reply_sent: expected {reply_sent}, got {}", result.reply_sent));
        }
    }
    if let Some(path) = &expect.path {
        let walked: Vec<String> = result.path.iter().map(ToString::to_string).collect();
        if &walked != path {
            unmet.push(format!(
                "path: expected {}, walked {}",
                path.join(" > "),
                walked.join(" > ")
            ));
        }
    }
    if let Some(final_step) = &expect.final_step {
        if result.final_step.as_str() != final_step {
            unmet.push(format!("final_step: expected `{final_step}`, got `{}`", result.final_step));
        }
    }
    if let Some(reason) = &expect.failure_reason {
        if result.failure_reason() != Some(reason.as_str()) {
            unmet.push(format!(
                "failure_reason: expected `{reason}`, got {:?}",
                result.failure_reason()
            ));
        }
    }
    if let Some(halt_reason) = &expect.halt_reason {
        if result.halt_reason.as_deref() != Some(halt_reason.as_str()) {
            unmet.push(format!(
                "halt_reason: expected `{halt_reason}`, got {:?}",
                result.halt_reason
            ));
        }
    }
    if let Some(ticket_id) = expect.ticket_id {
        if result.ticket_id != Some(TicketId(ticket_id)) {
            unmet.push(format!("ticket_id: expected {ticket_id}, got {:?}", result.ticket_id));
        }
    }

    unmet
}

fn render_report(
    scenario_path: &Path,
    result: &ProcessingResult,
    unused_replies: usize,
    passed: bool,
    unmet: &[String],
) -> CommandResult {
    let outcome = if result.success { "succeeded" } else { "failed" };
    let summary = format!(
        "replay: run {outcome} after {} steps and {} function calls",
        result.path.len(),
        result.records.len()
    );

    let mut lines = vec![summary.clone()];
    let path =
        result.path.iter().map(ToString::to_string).collect::<Vec<_>>().join(" > ");
    lines.push(format!("- path: {path}"));

    for record in &result.records {
        match &record.outcome {
            CallOutcome::Success { .. } => lines.push(format!("- call: {} ok", record.function)),
            CallOutcome::Failure { class, .. } => {
                lines.push(format!("- call: {} failed ({class})", record.function));
            }
        }
    }

    if let Some(ticket_id) = result.ticket_id {
        lines.push(format!("- ticket: {ticket_id}"));
    }
    if result.reply_sent {
        lines.push("- reply: sent".to_string());
    }
    if let Some(halt_reason) = &result.halt_reason {
        lines.push(format!("- halted: {halt_reason}"));
    }
    if let Some(failure) = &result.failure {
        lines.push(format!("- failure: {} at `{}`", failure.reason, failure.step));
    }
    if unused_replies > 0 {
        lines.push(format!("- note: {unused_replies} scripted replies were never used"));
    }
    for expectation in unmet {
        lines.push(format!("- unmet: {expectation}"));
    }

    let report = ReplayReport {
        command: "replay",
        status: if passed { "ok" } else { "fail" },
        scenario: scenario_path.display().to_string(),
        summary,
        unused_replies,
        unmet_expectations: unmet,
        result,
    };
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"replay\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });
    lines.push(machine);

    CommandResult { exit_code: if passed { 0 } else { 6 }, output: lines.join("\n") }
}

struct ReplayEntitlement {
    record: WarrantyRecord,
}

#[async_trait]
impl EntitlementClient for ReplayEntitlement {
    async fn check(&self, _serial_number: &str) -> Result<WarrantyRecord, CallError> {
        Ok(self.record.clone())
    }
}

struct ReplayTicketing {
    ticket_id: i64,
    agent_disabled: bool,
}

#[async_trait]
impl TicketingClient for ReplayTicketing {
    async fn create_ticket(&self, _ticket: &NewTicket) -> Result<TicketId, CallError> {
        Ok(TicketId(self.ticket_id))
    }

    async fn append_note(&self, _ticket_id: TicketId, _note: &str) -> Result<(), CallError> {
        Ok(())
    }

    async fn has_feature_flag(&self, _ticket_id: TicketId, flag: &str) -> Result<bool, CallError> {
        Ok(self.agent_disabled && flag == HALT_AGENT_DISABLED)
    }
}

struct ReplayMessaging {
    sent: AtomicU32,
}

#[async_trait]
impl MessagingClient for ReplayMessaging {
    async fn send(&self, _reply: &OutboundReply) -> Result<SentReceipt, CallError> {
        let sequence = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SentReceipt { message_id: format!("replay-sent-{sequence}") })
    }
}
