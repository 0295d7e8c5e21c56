//! The step engine: walks a message through the instruction set one
//! reasoning iteration at a time until DONE, a fatal error, or a budget
//! runs out.
//!
//! Nothing escapes [`StepOrchestrator::run`] as an error. Every ending,
//! normal or not, is folded into the returned [`ProcessingResult`];
//! callers branch on its fields, not on panics or error types.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use triago_core::clients::{dependency, functions};
use triago_core::config::{ConfigError, EngineConfig};
use triago_core::domain::{
    CallOutcome, FunctionCallRecord, InboundMessage, ProcessingResult, RunFailure,
    HALT_AGENT_DISABLED, REASON_INCOMPLETE, REASON_REPLY_NOT_SENT,
};
use triago_core::errors::OrchestrationError;
use triago_core::resilience::ResilienceRegistry;
use triago_core::steps::{
    parse_directive, DirectiveFlag, InstructionStore, StepDefinition, StepName,
    TransitionDirective, TransitionTarget,
};
use triago_core::ProcessingContext;

use crate::dispatch::FunctionDispatcher;
use crate::llm::{ConversationTurn, ReasoningClient, ReasoningReply};

/// Engine budgets and the step the walk begins at.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub entry_step: StepName,
    /// Reasoning calls allowed per run, across all steps.
    pub max_iterations: u32,
    pub run_deadline: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            entry_step: config.entry_step_name()?,
            max_iterations: config.max_iterations,
            run_deadline: config.run_deadline(),
        })
    }
}

pub struct StepOrchestrator {
    store: Arc<dyn InstructionStore>,
    reasoning: Arc<dyn ReasoningClient>,
    dispatcher: FunctionDispatcher,
    resilience: Arc<ResilienceRegistry>,
    settings: EngineSettings,
}

/// How the walk ended, before terminal invariants are applied.
enum RunVerdict {
    Completed,
    Halted(OrchestrationError),
    Cancelled,
}

struct RunState {
    context: ProcessingContext,
    current: StepName,
    path: Vec<StepName>,
    records: Vec<FunctionCallRecord>,
    iterations_used: u32,
    send_declared: bool,
    reply_sent: bool,
    /// Step that raised the agent-disabled flag, if any.
    agent_disabled_step: Option<StepName>,
}

impl RunState {
    fn new(message: InboundMessage, entry_step: StepName) -> Self {
        Self {
            context: ProcessingContext::for_message(message),
            current: entry_step,
            path: Vec::new(),
            records: Vec::new(),
            iterations_used: 0,
            send_declared: false,
            reply_sent: false,
            agent_disabled_step: None,
        }
    }

    /// Applies the terminal invariants and folds everything into the
    /// result. The delivered-reply obligation binds any path that
    /// visited a send-declaring step, unless a verified agent-disabled
    /// halt waives it.
    fn into_result(self, verdict: RunVerdict, elapsed: Duration) -> ProcessingResult {
        let mut halt_reason = None;
        let (success, failure) = match verdict {
            RunVerdict::Halted(error) => (
                false,
                Some(RunFailure {
                    step: error.step().clone(),
                    reason: error.reason_token().to_owned(),
                }),
            ),
            RunVerdict::Cancelled => (
                false,
                Some(RunFailure {
                    step: self.current.clone(),
                    reason: REASON_INCOMPLETE.to_owned(),
                }),
            ),
            RunVerdict::Completed => {
                if let Some(flag_step) = &self.agent_disabled_step {
                    if agent_disabled_verified(&self.records) {
                        halt_reason = Some(HALT_AGENT_DISABLED.to_owned());
                        (true, None)
                    } else {
                        let error = OrchestrationError::AgentDisabledUnverified {
                            step: flag_step.clone(),
                        };
                        (
                            false,
                            Some(RunFailure {
                                step: flag_step.clone(),
                                reason: error.reason_token().to_owned(),
                            }),
                        )
                    }
                } else if self.send_declared && !self.reply_sent {
                    (
                        false,
                        Some(RunFailure {
                            step: self.current.clone(),
                            reason: REASON_REPLY_NOT_SENT.to_owned(),
                        }),
                    )
                } else {
                    (true, None)
                }
            }
        };

        ProcessingResult {
            success,
            correlation_id: self.context.correlation_id,
            path: self.path,
            final_step: self.current,
            serial_number: self.context.serial_number,
            warranty_status: self.context.warranty.as_ref().map(|record| record.status),
            reply_sent: self.reply_sent,
            ticket_id: self.context.ticket_id,
            elapsed_ms: elapsed.as_millis() as u64,
            halt_reason,
            failure,
            records: self.records,
        }
    }
}

/// The waiver is evidence-based: the flag directive alone proves
/// nothing; a successful feature-flag lookup answering `enabled: true`
/// for the kill switch must be on record.
fn agent_disabled_verified(records: &[FunctionCallRecord]) -> bool {
    records.iter().any(|record| {
        record.function == functions::TICKET_FEATURE_FLAG
            && record.succeeded()
            && record
                .result()
                .map(|result| {
                    result.get("flag").and_then(Value::as_str) == Some(HALT_AGENT_DISABLED)
                        && result.get("enabled").and_then(Value::as_bool) == Some(true)
                })
                .unwrap_or(false)
    })
}

impl StepOrchestrator {
    pub fn new(
        store: Arc<dyn InstructionStore>,
        reasoning: Arc<dyn ReasoningClient>,
        dispatcher: FunctionDispatcher,
        resilience: Arc<ResilienceRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self { store, reasoning, dispatcher, resilience, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Processes one message start to finish without outside
    /// cancellation.
    pub async fn run(&self, message: InboundMessage) -> ProcessingResult {
        let (_never, shutdown) = watch::channel(false);
        self.run_with_shutdown(message, shutdown).await
    }

    /// Processes one message, checking the shutdown signal at every
    /// iteration boundary. A cancelled run ends as a failure with the
    /// `incomplete` reason and keeps the records gathered so far.
    pub async fn run_with_shutdown(
        &self,
        message: InboundMessage,
        shutdown: watch::Receiver<bool>,
    ) -> ProcessingResult {
        let started = Instant::now();
        let mut run = RunState::new(message, self.settings.entry_step.clone());
        info!(
            event_name = "engine.run.started",
            correlation_id = %run.context.correlation_id,
            message_id = %run.context.message.message_id,
            entry_step = %run.current,
            "triage run started"
        );

        let verdict = self.drive(&mut run, &shutdown, started).await;
        let correlation_id = run.context.correlation_id;
        let result = run.into_result(verdict, started.elapsed());

        if result.success {
            info!(
                event_name = "engine.run.completed",
                correlation_id = %correlation_id,
                steps = result.path.len(),
                reply_sent = result.reply_sent,
                halt_reason = result.halt_reason.as_deref().unwrap_or(""),
                elapsed_ms = result.elapsed_ms,
                "triage run completed"
            );
        } else {
            warn!(
                event_name = "engine.run.failed",
                correlation_id = %correlation_id,
                failure_step = result.failure_step().map(StepName::as_str).unwrap_or(""),
                failure_reason = result.failure_reason().unwrap_or(""),
                elapsed_ms = result.elapsed_ms,
                "triage run failed"
            );
        }
        result
    }

    async fn drive(
        &self,
        run: &mut RunState,
        shutdown: &watch::Receiver<bool>,
        started: Instant,
    ) -> RunVerdict {
        loop {
            run.path.push(run.current.clone());
            let step = match self.store.load(&run.current).await {
                Ok(step) => step,
                Err(error) => {
                    warn!(
                        event_name = "engine.step.load_failed",
                        correlation_id = %run.context.correlation_id,
                        step = %run.current,
                        error = %error,
                        "step could not be loaded"
                    );
                    return RunVerdict::Halted(OrchestrationError::UnknownStep {
                        step: run.current.clone(),
                    });
                }
            };
            if step.declares_send() {
                run.send_declared = true;
            }
            info!(
                event_name = "engine.step.entered",
                correlation_id = %run.context.correlation_id,
                step = %step.name,
                version = step.version,
                "entering step"
            );

            let directive = match self.work_step(run, &step, shutdown, started).await {
                Ok(directive) => directive,
                Err(verdict) => return verdict,
            };

            if !step.allows_transition(&directive.target) {
                return RunVerdict::Halted(OrchestrationError::IllegalTransition {
                    step: run.current.clone(),
                    target: directive.target.to_string(),
                });
            }
            for (key, value) in &directive.produced {
                run.context.record_produced(key, value);
            }
            for flag in &directive.flags {
                match flag {
                    // The kill switch only means anything on the
                    // terminal directive; elsewhere it is recorded like
                    // any other flag.
                    DirectiveFlag::AgentDisabled if directive.target.is_done() => {
                        run.agent_disabled_step.get_or_insert(run.current.clone());
                    }
                    other => run.context.record_produced(other.as_str(), "true"),
                }
            }
            info!(
                event_name = "engine.step.completed",
                correlation_id = %run.context.correlation_id,
                step = %run.current,
                target = %directive.target,
                iterations = run.iterations_used,
                "step completed"
            );

            match directive.target {
                TransitionTarget::Done => return RunVerdict::Completed,
                TransitionTarget::Step(next) => run.current = next,
            }
        }
    }

    /// Runs one step's conversation until the model hands back a
    /// parseable directive, or the run dies trying.
    async fn work_step(
        &self,
        run: &mut RunState,
        step: &StepDefinition,
        shutdown: &watch::Receiver<bool>,
        started: Instant,
    ) -> Result<TransitionDirective, RunVerdict> {
        let mut conversation = seed_conversation(step, &run.context);

        loop {
            if *shutdown.borrow() {
                return Err(RunVerdict::Cancelled);
            }
            if run.iterations_used >= self.settings.max_iterations {
                return Err(RunVerdict::Halted(OrchestrationError::IterationBudgetExceeded {
                    step: run.current.clone(),
                    budget: self.settings.max_iterations,
                }));
            }
            if started.elapsed() >= self.settings.run_deadline {
                return Err(RunVerdict::Halted(OrchestrationError::RunDeadlineExceeded {
                    step: run.current.clone(),
                    deadline: self.settings.run_deadline,
                }));
            }
            run.iterations_used += 1;

            let policy = self.resilience.for_dependency(dependency::REASONING);
            let outcome =
                policy.execute(|| self.reasoning.complete(&conversation, &step.functions)).await;
            let reply = match outcome.result {
                Ok(reply) => reply,
                Err(error) => {
                    return Err(RunVerdict::Halted(OrchestrationError::ReasoningUnavailable {
                        step: run.current.clone(),
                        detail: error.to_string(),
                    }))
                }
            };

            match reply {
                ReasoningReply::FunctionCall(call) => {
                    let Some(spec) = step.function(&call.function) else {
                        return Err(RunVerdict::Halted(OrchestrationError::UndeclaredFunction {
                            step: run.current.clone(),
                            function: call.function,
                        }));
                    };

                    let record =
                        self.dispatcher.execute(spec, &run.context, call.arguments).await;

                    conversation.push(ConversationTurn::assistant(
                        json!({ "call": &record.function, "arguments": &record.arguments })
                            .to_string(),
                    ));
                    let feedback = match &record.outcome {
                        CallOutcome::Success { result } => json!({
                            "function": &record.function,
                            "status": "success",
                            "result": result,
                        }),
                        CallOutcome::Failure { class, message, .. } => json!({
                            "function": &record.function,
                            "status": "failure",
                            "class": class,
                            "message": message,
                        }),
                    };
                    conversation.push(ConversationTurn::user(feedback.to_string()));

                    if record.succeeded() {
                        if let Some(result) = record.result() {
                            run.context.absorb_function_result(&record.function, result);
                        }
                        if record.function == functions::SEND_REPLY {
                            run.reply_sent = true;
                        }
                    }
                    run.records.push(record);
                }
                ReasoningReply::Text(text) => match parse_directive(&text) {
                    Ok(directive) => return Ok(directive),
                    Err(error) => {
                        return Err(RunVerdict::Halted(OrchestrationError::MissingDirective {
                            step: run.current.clone(),
                            detail: error.to_string(),
                        }))
                    }
                },
            }
        }
    }
}

/// Builds the fresh conversation a step starts from: its instruction
/// body plus the directive contract, and the context narrowed to the
/// step's allow-list. Previous steps' chatter never carries over.
fn seed_conversation(step: &StepDefinition, context: &ProcessingContext) -> Vec<ConversationTurn> {
    let mut prompt = String::with_capacity(step.instructions.len() + 256);
    prompt.push_str(step.instructions.trim());

    if !step.functions.is_empty() {
        let names: Vec<&str> = step.functions.iter().map(|spec| spec.name.as_str()).collect();
        prompt.push_str("\n\nAvailable functions: ");
        prompt.push_str(&names.join(", "));
        prompt.push('.');
    }

    let targets: Vec<String> = step.next_steps.iter().map(ToString::to_string).collect();
    prompt.push_str(
        "\n\nWhen this step is complete, finish with a final line of the form \
         `NEXT_STEP: <target>`, optionally followed by `(flag, key=value, ...)`. \
         Allowed targets: ",
    );
    prompt.push_str(&targets.join(", "));
    prompt.push('.');

    let narrowed = context.narrow(&step.context_fields);
    let context_value =
        Value::Object(narrowed.into_iter().map(|(key, value)| (key, Value::String(value))).collect());

    vec![ConversationTurn::system(prompt), ConversationTurn::user(context_value.to_string())]
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};

    use triago_core::clients::{EntitlementClient, MessagingClient, TicketingClient};
    use triago_core::domain::{
        InboundMessage, NewTicket, OutboundReply, SentReceipt, TicketId, WarrantyRecord,
        WarrantyStatus,
    };
    use triago_core::errors::CallError;
    use triago_core::resilience::{CircuitBreakerConfig, ResilienceRegistry, RetryPolicy};
    use triago_core::steps::{
        FunctionSpec, InMemoryInstructionStore, StepDefinition, StepName, TransitionTarget,
    };

    use crate::dispatch::FunctionDispatcher;
    use crate::functions::register_standard_handlers;
    use crate::llm::{
        ConversationTurn, FunctionCallRequest, ReasoningClient, ReasoningReply,
        ScriptedReasoningClient,
    };

    use super::{EngineSettings, StepOrchestrator};

    struct FakeEntitlement {
        calls: AtomicU32,
    }

    impl Default for FakeEntitlement {
        fn default() -> Self {
            Self { calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl EntitlementClient for FakeEntitlement {
        async fn check(&self, _serial_number: &str) -> Result<WarrantyRecord, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(WarrantyRecord {
                status: WarrantyStatus::Valid,
                expires_at: None,
                repair_window_hours: Some(24),
            })
        }
    }

    struct FakeTicketing {
        next_id: AtomicI64,
        flag_enabled: bool,
        created: Mutex<Vec<NewTicket>>,
        notes: Mutex<Vec<(TicketId, String)>>,
    }

    impl FakeTicketing {
        fn disabled_agent(ticket_id: i64) -> Self {
            Self { next_id: AtomicI64::new(ticket_id), flag_enabled: true, ..Self::default() }
        }
    }

    impl Default for FakeTicketing {
        fn default() -> Self {
            Self {
                next_id: AtomicI64::new(71),
                flag_enabled: false,
                created: Mutex::new(Vec::new()),
                notes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TicketingClient for FakeTicketing {
        async fn create_ticket(&self, ticket: &NewTicket) -> Result<TicketId, CallError> {
            self.created.lock().expect("created lock").push(ticket.clone());
            Ok(TicketId(self.next_id.load(Ordering::SeqCst)))
        }

        async fn append_note(&self, ticket_id: TicketId, note: &str) -> Result<(), CallError> {
            self.notes.lock().expect("notes lock").push((ticket_id, note.to_owned()));
            Ok(())
        }

        async fn has_feature_flag(
            &self,
            _ticket_id: TicketId,
            _flag: &str,
        ) -> Result<bool, CallError> {
            Ok(self.flag_enabled)
        }
    }

    #[derive(Default)]
    struct FakeMessaging {
        sent: Mutex<Vec<OutboundReply>>,
    }

    impl FakeMessaging {
        fn sent_count(&self) -> usize {
            self.sent.lock().expect("sent lock").len()
        }
    }

    #[async_trait]
    impl MessagingClient for FakeMessaging {
        async fn send(&self, reply: &OutboundReply) -> Result<SentReceipt, CallError> {
            self.sent.lock().expect("sent lock").push(reply.clone());
            Ok(SentReceipt { message_id: "out-1".to_owned() })
        }
    }

    fn message() -> InboundMessage {
        InboundMessage {
            message_id: "msg-1".to_owned(),
            sender: "customer@example.com".to_owned(),
            subject: "charger died".to_owned(),
            body: "serial is SN-20AB-93XK, unit will not charge".to_owned(),
            thread_id: None,
            received_at: Utc::now(),
        }
    }

    fn function_spec(name: &str, required: &[&str]) -> FunctionSpec {
        FunctionSpec {
            name: name.to_owned(),
            description: String::new(),
            parameters: json!({ "type": "object" }),
            required: required.iter().map(|field| (*field).to_owned()).collect(),
        }
    }

    fn step(
        name: &str,
        functions: Vec<FunctionSpec>,
        next: &[&str],
        fields: &[&str],
    ) -> StepDefinition {
        StepDefinition {
            name: StepName::new(name).expect("step name"),
            version: 1,
            description: String::new(),
            instructions: format!("You are working the {name} step."),
            functions,
            next_steps: next
                .iter()
                .map(|target| TransitionTarget::parse(target).expect("target"))
                .collect(),
            context_fields: fields.iter().map(|field| (*field).to_owned()).collect(),
        }
    }

    fn triage_steps() -> Vec<StepDefinition> {
        vec![
            step(
                "extract-identifier",
                vec![],
                &["check-warranty", "create-ticket"],
                &["subject", "body"],
            ),
            step(
                "check-warranty",
                vec![function_spec("check_warranty", &["serial_number"])],
                &["create-ticket"],
                &["serial_number"],
            ),
            step(
                "create-ticket",
                vec![
                    function_spec("create_ticket", &["summary"]),
                    function_spec("ticket_feature_flag", &["flag"]),
                ],
                &["send-reply", "DONE"],
                &["sender", "subject", "serial_number", "warranty_status", "ticket_id"],
            ),
            step(
                "send-reply",
                vec![
                    function_spec("send_reply", &["body"]),
                    function_spec("append_ticket_note", &["note"]),
                ],
                &["DONE"],
                &["sender", "subject", "warranty_status", "ticket_id"],
            ),
        ]
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            entry_step: StepName::new("extract-identifier").expect("entry step"),
            max_iterations: 10,
            run_deadline: Duration::from_secs(120),
        }
    }

    fn call(function: &str, arguments: Value) -> Result<ReasoningReply, CallError> {
        Ok(ReasoningReply::FunctionCall(FunctionCallRequest {
            function: function.to_owned(),
            arguments,
        }))
    }

    fn text(content: &str) -> Result<ReasoningReply, CallError> {
        Ok(ReasoningReply::Text(content.to_owned()))
    }

    fn transient() -> CallError {
        CallError::Connection { dependency: "reasoning".to_owned(), message: "reset".to_owned() }
    }

    struct Harness {
        orchestrator: StepOrchestrator,
        reasoning: Arc<ScriptedReasoningClient>,
        ticketing: Arc<FakeTicketing>,
        messaging: Arc<FakeMessaging>,
        entitlement: Arc<FakeEntitlement>,
    }

    fn orchestrator_with(
        definitions: Vec<StepDefinition>,
        reasoning: Arc<dyn ReasoningClient>,
        settings: EngineSettings,
        registry: Arc<ResilienceRegistry>,
        ticketing: Arc<FakeTicketing>,
        messaging: Arc<FakeMessaging>,
        entitlement: Arc<FakeEntitlement>,
    ) -> StepOrchestrator {
        let store = Arc::new(InMemoryInstructionStore::with_steps(definitions));
        let mut dispatcher = FunctionDispatcher::new(Arc::clone(&registry), Duration::from_secs(10));
        register_standard_handlers(&mut dispatcher, entitlement, ticketing, messaging);
        StepOrchestrator::new(store, reasoning, dispatcher, registry, settings)
    }

    fn harness_with(
        definitions: Vec<StepDefinition>,
        replies: Vec<Result<ReasoningReply, CallError>>,
        settings: EngineSettings,
        registry: Arc<ResilienceRegistry>,
    ) -> Harness {
        let reasoning = Arc::new(ScriptedReasoningClient::new(replies));
        let ticketing = Arc::new(FakeTicketing::default());
        let messaging = Arc::new(FakeMessaging::default());
        let entitlement = Arc::new(FakeEntitlement::default());
        let orchestrator = orchestrator_with(
            definitions,
            reasoning.clone(),
            settings,
            registry,
            ticketing.clone(),
            messaging.clone(),
            entitlement.clone(),
        );
        Harness { orchestrator, reasoning, ticketing, messaging, entitlement }
    }

    fn harness(replies: Vec<Result<ReasoningReply, CallError>>) -> Harness {
        harness_with(triage_steps(), replies, settings(), Arc::new(ResilienceRegistry::default()))
    }

    #[tokio::test]
    async fn happy_path_walks_all_steps_and_sends_the_reply() {
        let harness = harness(vec![
            text("Found a serial in the body.\nNEXT_STEP: check-warranty (serial_number=SN-20AB-93XK)"),
            call("check_warranty", json!({ "serial_number": "SN-20AB-93XK" })),
            text("Warranty is valid.\nNEXT_STEP: create-ticket"),
            call("create_ticket", json!({ "summary": "unit will not charge" })),
            text("Ticket filed.\nNEXT_STEP: send-reply"),
            call("append_ticket_note", json!({ "note": "replied with warranty coverage" })),
            call("send_reply", json!({ "body": "Your warranty covers this repair." })),
            text("Reply delivered.\nNEXT_STEP: DONE"),
        ]);

        let result = harness.orchestrator.run(message()).await;

        assert!(result.success, "run should succeed: {:?}", result.failure);
        assert!(result.failure.is_none());
        assert!(result.halt_reason.is_none());
        assert!(result.reply_sent);
        assert_eq!(result.serial_number.as_deref(), Some("SN-20AB-93XK"));
        assert_eq!(result.warranty_status, Some(WarrantyStatus::Valid));
        assert_eq!(result.ticket_id, Some(TicketId(71)));
        assert_eq!(
            result.path.iter().map(|step| step.as_str()).collect::<Vec<_>>(),
            vec!["extract-identifier", "check-warranty", "create-ticket", "send-reply"],
        );
        assert_eq!(result.final_step.as_str(), "send-reply");
        assert_eq!(result.records.len(), 4);
        assert!(result.records.iter().all(|record| record.succeeded()));
        assert_eq!(harness.reasoning.calls(), 8);
        assert_eq!(harness.messaging.sent_count(), 1);
        let notes = harness.ticketing.notes.lock().expect("notes lock");
        assert_eq!(notes.as_slice(), &[(TicketId(71), "replied with warranty coverage".to_owned())]);
    }

    #[tokio::test]
    async fn done_without_a_sent_reply_fails_the_run() {
        let harness = harness(vec![
            text("NEXT_STEP: create-ticket"),
            text("NEXT_STEP: send-reply"),
            text("Nothing left to say.\nNEXT_STEP: DONE"),
        ]);

        let result = harness.orchestrator.run(message()).await;

        assert!(!result.success);
        assert!(!result.reply_sent);
        assert_eq!(result.failure_reason(), Some("reply_not_sent"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("send-reply"));
        assert_eq!(harness.messaging.sent_count(), 0);
    }

    #[tokio::test]
    async fn verified_agent_disabled_halt_succeeds_without_a_reply() {
        let reasoning = Arc::new(ScriptedReasoningClient::new(vec![
            text("NEXT_STEP: create-ticket"),
            call("create_ticket", json!({ "summary": "duplicate report" })),
            call("ticket_feature_flag", json!({ "flag": "agent_disabled" })),
            text("Agent is switched off for this ticket.\nNEXT_STEP: DONE (agent_disabled)"),
        ]));
        let messaging = Arc::new(FakeMessaging::default());
        let orchestrator = orchestrator_with(
            triage_steps(),
            reasoning.clone(),
            settings(),
            Arc::new(ResilienceRegistry::default()),
            Arc::new(FakeTicketing::disabled_agent(-41)),
            messaging.clone(),
            Arc::new(FakeEntitlement::default()),
        );

        let result = orchestrator.run(message()).await;

        assert!(result.success, "verified opt-out should succeed: {:?}", result.failure);
        assert_eq!(result.halt_reason.as_deref(), Some("agent_disabled"));
        assert!(!result.reply_sent);
        assert!(result.failure.is_none());
        assert_eq!(result.ticket_id, Some(TicketId(-41)));
        assert_eq!(messaging.sent_count(), 0);
    }

    #[tokio::test]
    async fn unverified_agent_disabled_flag_fails_the_run() {
        let harness = harness(vec![
            text("NEXT_STEP: create-ticket"),
            call("create_ticket", json!({ "summary": "duplicate report" })),
            text("Calling it off.\nNEXT_STEP: DONE (agent_disabled)"),
        ]);

        let result = harness.orchestrator.run(message()).await;

        assert!(!result.success);
        assert_eq!(result.failure_reason(), Some("agent_disabled_unverified"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("create-ticket"));
        assert!(result.halt_reason.is_none());
    }

    #[tokio::test]
    async fn undeclared_function_call_is_fatal_and_never_dispatched() {
        let harness = harness(vec![call(
            "check_warranty",
            json!({ "serial_number": "SN-20AB-93XK" }),
        )]);

        let result = harness.orchestrator.run(message()).await;

        assert!(!result.success);
        assert_eq!(result.failure_reason(), Some("undeclared_function"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("extract-identifier"));
        assert!(result.records.is_empty());
        assert_eq!(harness.entitlement.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn terminal_text_without_directive_is_fatal() {
        let harness = harness(vec![text("I think we should probably make a ticket.")]);

        let result = harness.orchestrator.run(message()).await;

        assert!(!result.success);
        assert_eq!(result.failure_reason(), Some("missing_directive"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("extract-identifier"));
    }

    #[tokio::test]
    async fn transition_outside_the_declared_set_is_fatal() {
        let harness = harness(vec![text("NEXT_STEP: send-reply")]);

        let result = harness.orchestrator.run(message()).await;

        assert!(!result.success);
        assert_eq!(result.failure_reason(), Some("illegal_transition"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("extract-identifier"));
        assert_eq!(result.path.len(), 1);
    }

    #[tokio::test]
    async fn transition_to_a_step_missing_from_the_store_is_fatal() {
        let definitions = vec![step(
            "extract-identifier",
            vec![],
            &["check-warranty"],
            &["subject"],
        )];
        let harness = harness_with(
            definitions,
            vec![text("NEXT_STEP: check-warranty")],
            settings(),
            Arc::new(ResilienceRegistry::default()),
        );

        let result = harness.orchestrator.run(message()).await;

        assert!(!result.success);
        assert_eq!(result.failure_reason(), Some("unknown_step"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("check-warranty"));
        assert_eq!(
            result.path.iter().map(|step| step.as_str()).collect::<Vec<_>>(),
            vec!["extract-identifier", "check-warranty"],
        );
    }

    #[tokio::test]
    async fn iteration_budget_caps_reasoning_calls_across_the_whole_run() {
        let mut limited = settings();
        limited.max_iterations = 3;
        let harness = harness_with(
            triage_steps(),
            vec![
                text("NEXT_STEP: create-ticket"),
                call("create_ticket", json!({ "summary": "first" })),
                call("ticket_feature_flag", json!({ "flag": "agent_disabled" })),
            ],
            limited,
            Arc::new(ResilienceRegistry::default()),
        );

        let result = harness.orchestrator.run(message()).await;

        assert!(!result.success);
        assert_eq!(result.failure_reason(), Some("iteration_budget_exceeded"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("create-ticket"));
        assert_eq!(harness.reasoning.calls(), 3);
    }

    #[tokio::test]
    async fn failed_dispatch_is_fed_back_and_the_model_can_recover() {
        let harness = harness(vec![
            text("NEXT_STEP: create-ticket"),
            // Missing the required summary; recorded, fed back, retried.
            call("create_ticket", json!({})),
            call("create_ticket", json!({ "summary": "unit will not charge" })),
            text("NEXT_STEP: DONE"),
        ]);

        let result = harness.orchestrator.run(message()).await;

        assert!(result.success, "recovered run should succeed: {:?}", result.failure);
        assert_eq!(result.records.len(), 2);
        assert!(!result.records[0].succeeded());
        assert_eq!(result.records[0].attempts, 0);
        assert!(result.records[1].succeeded());
        assert_eq!(result.ticket_id, Some(TicketId(71)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reasoning_retries_fail_the_run_as_unavailable() {
        let harness = harness(vec![Err(transient()), Err(transient()), Err(transient())]);

        let result = harness.orchestrator.run(message()).await;

        assert!(!result.success);
        assert_eq!(result.failure_reason(), Some("reasoning_unavailable"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("extract-identifier"));
        assert!(result.records.is_empty());
        // One composite call of three attempts.
        assert_eq!(harness.reasoning.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reasoning_breaker_state_carries_across_runs() {
        let registry = Arc::new(ResilienceRegistry::new(
            RetryPolicy { max_attempts: 1, ..RetryPolicy::default() },
            CircuitBreakerConfig { failure_threshold: 1, cooldown: Duration::from_secs(60) },
        ));

        let first = harness_with(
            triage_steps(),
            vec![Err(transient())],
            settings(),
            Arc::clone(&registry),
        );
        let opened = first.orchestrator.run(message()).await;
        assert_eq!(opened.failure_reason(), Some("reasoning_unavailable"));
        assert_eq!(first.reasoning.calls(), 1);

        let second = harness_with(
            triage_steps(),
            vec![text("NEXT_STEP: create-ticket")],
            settings(),
            registry,
        );
        let rejected = second.orchestrator.run(message()).await;

        assert_eq!(rejected.failure_reason(), Some("reasoning_unavailable"));
        // The breaker rejected the call before the client saw it.
        assert_eq!(second.reasoning.calls(), 0);
    }

    #[tokio::test]
    async fn shutdown_signal_ends_the_run_as_incomplete() {
        let harness = harness(vec![text("NEXT_STEP: create-ticket")]);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(true);

        let result = harness.orchestrator.run_with_shutdown(message(), shutdown_rx).await;
        drop(shutdown_tx);

        assert!(!result.success);
        assert_eq!(result.failure_reason(), Some("incomplete"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("extract-identifier"));
        assert_eq!(harness.reasoning.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_deadline_is_checked_at_iteration_boundaries() {
        struct SlowReasoning;

        #[async_trait]
        impl ReasoningClient for SlowReasoning {
            async fn complete(
                &self,
                _conversation: &[ConversationTurn],
                _functions: &[FunctionSpec],
            ) -> Result<ReasoningReply, CallError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(ReasoningReply::Text("NEXT_STEP: check-warranty".to_owned()))
            }
        }

        let mut tight = settings();
        tight.run_deadline = Duration::from_secs(5);
        let orchestrator = orchestrator_with(
            triage_steps(),
            Arc::new(SlowReasoning),
            tight,
            Arc::new(ResilienceRegistry::default()),
            Arc::new(FakeTicketing::default()),
            Arc::new(FakeMessaging::default()),
            Arc::new(FakeEntitlement::default()),
        );

        let result = orchestrator.run(message()).await;

        assert!(!result.success);
        assert_eq!(result.failure_reason(), Some("run_deadline_exceeded"));
        assert_eq!(result.failure_step().map(StepName::as_str), Some("check-warranty"));
    }

    #[tokio::test]
    async fn steps_only_see_their_context_allow_list() {
        struct RecordingReasoning {
            inner: ScriptedReasoningClient,
            conversations: Mutex<Vec<Vec<ConversationTurn>>>,
        }

        #[async_trait]
        impl ReasoningClient for RecordingReasoning {
            async fn complete(
                &self,
                conversation: &[ConversationTurn],
                functions: &[FunctionSpec],
            ) -> Result<ReasoningReply, CallError> {
                self.conversations
                    .lock()
                    .expect("conversations lock")
                    .push(conversation.to_vec());
                self.inner.complete(conversation, functions).await
            }
        }

        let definitions = vec![step("extract-identifier", vec![], &["DONE"], &["subject"])];
        let reasoning = Arc::new(RecordingReasoning {
            inner: ScriptedReasoningClient::new(vec![text("NEXT_STEP: DONE")]),
            conversations: Mutex::new(Vec::new()),
        });
        let orchestrator = orchestrator_with(
            definitions,
            reasoning.clone(),
            settings(),
            Arc::new(ResilienceRegistry::default()),
            Arc::new(FakeTicketing::default()),
            Arc::new(FakeMessaging::default()),
            Arc::new(FakeEntitlement::default()),
        );

        let result = orchestrator.run(message()).await;
        assert!(result.success);

        let conversations = reasoning.conversations.lock().expect("conversations lock");
        let seeded = &conversations[0];
        assert_eq!(seeded.len(), 2);
        let context_turn = &seeded[1].content;
        assert!(context_turn.contains("charger died"), "subject should be visible");
        assert!(!context_turn.contains("\"body\""), "body is outside the allow-list");
        assert!(!context_turn.contains("customer@example.com"), "sender is outside the allow-list");
    }

    #[tokio::test]
    async fn directive_urgent_flag_carries_into_the_created_ticket() {
        let harness = harness(vec![
            text("NEXT_STEP: create-ticket (urgent, serial_number=SN-20AB-93XK)"),
            call("create_ticket", json!({ "summary": "battery swollen" })),
            text("NEXT_STEP: DONE"),
        ]);

        let result = harness.orchestrator.run(message()).await;

        assert!(result.success);
        assert_eq!(result.ticket_id, Some(TicketId(71)));
        let created = harness.ticketing.created.lock().expect("created lock");
        assert_eq!(created.len(), 1);
        assert!(created[0].urgent, "urgent directive flag should mark the ticket");
        assert_eq!(created[0].serial_number.as_deref(), Some("SN-20AB-93XK"));
        assert_eq!(created[0].sender, "customer@example.com");
    }
}
