pub mod clients;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod resilience;
pub mod steps;

pub use clients::{EntitlementClient, MessagingClient, TicketingClient};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use context::ProcessingContext;
pub use domain::message::{InboundMessage, OutboundReply, SentReceipt};
pub use domain::run::{CallOutcome, FunctionCallRecord, ProcessingResult, RunFailure};
pub use domain::ticket::{NewTicket, TicketId};
pub use domain::warranty::{WarrantyRecord, WarrantyStatus};
pub use errors::{CallError, FailureKind, OrchestrationError};
pub use resilience::{
    BreakerSnapshot, CircuitBreakerConfig, ResiliencePolicy, ResilienceRegistry, RetryOutcome,
    RetryPolicy,
};
pub use steps::{
    InstructionStore, StepDefinition, StepName, TransitionDirective, TransitionTarget,
};
