//! Agent runtime - LLM-driven step orchestration for inbound support mail
//!
//! This crate provides the "brain" of the triago system - the engine that:
//! - Walks a message through externally defined triage steps
//! - Asks the reasoning model what to do next, one iteration at a time
//! - Dispatches backend function calls behind retry and circuit breakers
//! - Folds every outcome into a single auditable `ProcessingResult`
//!
//! # Architecture
//!
//! The engine follows a constrained loop:
//! 1. **Step Entry** (`orchestrator`) - Load the step, narrow the context, seed a fresh conversation
//! 2. **Reasoning** (`llm`) - Ask for the next action: a function call or a transition directive
//! 3. **Dispatch** (`dispatch`, `functions`) - Execute declared calls and feed results back
//! 4. **Transition** - Validate the directive against the step's declared targets
//!
//! # Key Types
//!
//! - `StepOrchestrator` - Main engine (see `orchestrator` module)
//! - `ReasoningClient` - Pluggable trait for OpenAI-compatible chat backends
//! - `FunctionDispatcher` - Resilience-guarded registry of backend handlers
//!
//! # Safety Principle
//!
//! The model is strictly an advisor. It NEVER picks recipients, ticket ids,
//! or transitions outside a step's declared set. Those are deterministic
//! decisions made by the engine from system-owned context.

pub mod dispatch;
pub mod functions;
pub mod llm;
pub mod orchestrator;
