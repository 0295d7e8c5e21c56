use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use triago_agent::dispatch::FunctionDispatcher;
use triago_agent::functions::register_standard_handlers;
use triago_agent::llm::HttpReasoningClient;
use triago_agent::orchestrator::{EngineSettings, StepOrchestrator};
use triago_core::config::{AppConfig, ConfigError, LoadOptions};
use triago_core::domain::{InboundMessage, ProcessingResult};
use triago_core::resilience::ResilienceRegistry;
use triago_core::steps::{FileInstructionStore, StepStoreError};
use triago_mail::{HttpMailApi, MailPoller, MessageProcessor, PollerSettings, ReconnectPolicy};

use crate::backends::{HttpEntitlementClient, HttpTicketingClient};

pub struct Application {
    pub config: AppConfig,
    pub store: Arc<FileInstructionStore>,
    pub resilience: Arc<ResilienceRegistry>,
    pub orchestrator: Arc<StepOrchestrator>,
    pub poller: MailPoller,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("instruction set failed to load: {0}")]
    Instructions(#[from] StepStoreError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let store = Arc::new(FileInstructionStore::load_dir(&config.engine.instructions_dir).await?);
    let definitions = store.definitions();
    info!(
        event_name = "system.bootstrap.instructions_loaded",
        steps = definitions.len(),
        dir = %store.dir().display(),
        "instruction set loaded"
    );

    let settings = EngineSettings::from_config(&config.engine)?;
    if !definitions.iter().any(|definition| definition.name == settings.entry_step) {
        return Err(BootstrapError::Config(ConfigError::Validation(format!(
            "engine.entry_step `{}` is not in the instruction set",
            settings.entry_step
        ))));
    }

    let resilience = Arc::new(ResilienceRegistry::new(
        config.resilience.retry_policy(),
        config.resilience.breaker_config(),
    ));

    let mail_api = Arc::new(HttpMailApi::new(&config.mailbox));
    let reasoning = Arc::new(HttpReasoningClient::new(&config.reasoning));
    let entitlement = Arc::new(HttpEntitlementClient::new(&config.entitlement));
    let ticketing = Arc::new(HttpTicketingClient::new(&config.ticketing));

    let mut dispatcher =
        FunctionDispatcher::new(Arc::clone(&resilience), config.engine.function_timeout());
    register_standard_handlers(&mut dispatcher, entitlement, ticketing, mail_api.clone());
    info!(
        event_name = "system.bootstrap.functions_registered",
        functions = dispatcher.len(),
        "backend function handlers registered"
    );

    let orchestrator = Arc::new(StepOrchestrator::new(
        store.clone(),
        reasoning,
        dispatcher,
        Arc::clone(&resilience),
        settings,
    ));

    let poller_settings = PollerSettings {
        poll_interval: config.mailbox.poll_interval(),
        max_concurrent_runs: config.mailbox.max_concurrent_runs,
        graceful_shutdown: config.server.graceful_shutdown(),
    };
    let poller = MailPoller::new(
        mail_api.clone(),
        Arc::new(EngineProcessor { orchestrator: Arc::clone(&orchestrator) }),
        ReconnectPolicy::default(),
        poller_settings,
    );

    info!(
        event_name = "system.bootstrap.engine_ready",
        entry_step = %orchestrator.settings().entry_step,
        "triage engine wired and ready"
    );

    Ok(Application { config, store, resilience, orchestrator, poller })
}

/// Feeds pulled mailbox messages into the step engine.
struct EngineProcessor {
    orchestrator: Arc<StepOrchestrator>,
}

#[async_trait]
impl MessageProcessor for EngineProcessor {
    async fn process(
        &self,
        message: InboundMessage,
        shutdown: watch::Receiver<bool>,
    ) -> ProcessingResult {
        self.orchestrator.run_with_shutdown(message, shutdown).await
    }
}
