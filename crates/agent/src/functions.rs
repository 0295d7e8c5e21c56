//! The backend function set steps may declare: warranty lookup, ticket
//! create/note/flag, and outbound reply delivery.
//!
//! Addressing is system-owned. Replies go to the recorded sender, notes
//! and flags go to the ticket already in the context; the model supplies
//! content, never routing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use triago_core::clients::{dependency, functions};
use triago_core::clients::{EntitlementClient, MessagingClient, TicketingClient};
use triago_core::domain::{NewTicket, OutboundReply, TicketId};
use triago_core::errors::CallError;
use triago_core::ProcessingContext;

use crate::dispatch::{FunctionDispatcher, FunctionHandler};

/// Registers the full production handler set on a dispatcher.
pub fn register_standard_handlers(
    dispatcher: &mut FunctionDispatcher,
    entitlement: Arc<dyn EntitlementClient>,
    ticketing: Arc<dyn TicketingClient>,
    messaging: Arc<dyn MessagingClient>,
) {
    dispatcher.register(Arc::new(WarrantyLookupHandler::new(entitlement)));
    dispatcher.register(Arc::new(CreateTicketHandler::new(Arc::clone(&ticketing))));
    dispatcher.register(Arc::new(AppendTicketNoteHandler::new(Arc::clone(&ticketing))));
    dispatcher.register(Arc::new(TicketFeatureFlagHandler::new(ticketing)));
    dispatcher.register(Arc::new(SendReplyHandler::new(messaging)));
}

fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, CallError> {
    arguments.get(key).and_then(Value::as_str).filter(|value| !value.trim().is_empty()).ok_or_else(
        || CallError::Validation { message: format!("argument `{key}` must be a non-empty string") },
    )
}

fn optional_str<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(Value::as_str).filter(|value| !value.trim().is_empty())
}

fn ticket_in_context(context: &ProcessingContext) -> Result<TicketId, CallError> {
    context.ticket_id.ok_or_else(|| CallError::Validation {
        message: "no ticket in context; create_ticket must run first".to_owned(),
    })
}

pub struct WarrantyLookupHandler {
    entitlement: Arc<dyn EntitlementClient>,
}

impl WarrantyLookupHandler {
    pub fn new(entitlement: Arc<dyn EntitlementClient>) -> Self {
        Self { entitlement }
    }
}

#[async_trait]
impl FunctionHandler for WarrantyLookupHandler {
    fn name(&self) -> &'static str {
        functions::CHECK_WARRANTY
    }

    fn dependency(&self) -> &'static str {
        dependency::ENTITLEMENT
    }

    async fn invoke(
        &self,
        _context: &ProcessingContext,
        arguments: &Value,
    ) -> Result<Value, CallError> {
        let serial = required_str(arguments, "serial_number")?;
        let record = self.entitlement.check(serial).await?;
        serde_json::to_value(&record).map_err(|error| CallError::MalformedResponse {
            dependency: dependency::ENTITLEMENT.to_owned(),
            message: error.to_string(),
        })
    }
}

pub struct CreateTicketHandler {
    ticketing: Arc<dyn TicketingClient>,
}

impl CreateTicketHandler {
    pub fn new(ticketing: Arc<dyn TicketingClient>) -> Self {
        Self { ticketing }
    }
}

#[async_trait]
impl FunctionHandler for CreateTicketHandler {
    fn name(&self) -> &'static str {
        functions::CREATE_TICKET
    }

    fn dependency(&self) -> &'static str {
        dependency::TICKETING
    }

    async fn invoke(
        &self,
        context: &ProcessingContext,
        arguments: &Value,
    ) -> Result<Value, CallError> {
        let summary = required_str(arguments, "summary")?;
        let subject = optional_str(arguments, "subject").unwrap_or(&context.message.subject);
        let urgent = arguments
            .get("urgent")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| context.field("urgent").as_deref() == Some("true"));

        let ticket = NewTicket {
            sender: context.message.sender.clone(),
            subject: subject.to_owned(),
            summary: summary.to_owned(),
            serial_number: context.serial_number.clone(),
            urgent,
        };
        let id = self.ticketing.create_ticket(&ticket).await?;

        Ok(json!({
            "ticket_id": id.0,
            "preexisting": id.is_preexisting(),
        }))
    }
}

pub struct AppendTicketNoteHandler {
    ticketing: Arc<dyn TicketingClient>,
}

impl AppendTicketNoteHandler {
    pub fn new(ticketing: Arc<dyn TicketingClient>) -> Self {
        Self { ticketing }
    }
}

#[async_trait]
impl FunctionHandler for AppendTicketNoteHandler {
    fn name(&self) -> &'static str {
        functions::APPEND_TICKET_NOTE
    }

    fn dependency(&self) -> &'static str {
        dependency::TICKETING
    }

    async fn invoke(
        &self,
        context: &ProcessingContext,
        arguments: &Value,
    ) -> Result<Value, CallError> {
        let note = required_str(arguments, "note")?;
        let ticket = ticket_in_context(context)?;
        // Backends only know the canonical id, whichever sign the
        // create call reported.
        let canonical = TicketId(ticket.canonical());
        self.ticketing.append_note(canonical, note).await?;

        Ok(json!({ "ticket_id": canonical.0, "appended": true }))
    }
}

pub struct TicketFeatureFlagHandler {
    ticketing: Arc<dyn TicketingClient>,
}

impl TicketFeatureFlagHandler {
    pub fn new(ticketing: Arc<dyn TicketingClient>) -> Self {
        Self { ticketing }
    }
}

#[async_trait]
impl FunctionHandler for TicketFeatureFlagHandler {
    fn name(&self) -> &'static str {
        functions::TICKET_FEATURE_FLAG
    }

    fn dependency(&self) -> &'static str {
        dependency::TICKETING
    }

    async fn invoke(
        &self,
        context: &ProcessingContext,
        arguments: &Value,
    ) -> Result<Value, CallError> {
        let flag = required_str(arguments, "flag")?;
        let ticket = ticket_in_context(context)?;
        let canonical = TicketId(ticket.canonical());
        let enabled = self.ticketing.has_feature_flag(canonical, flag).await?;

        Ok(json!({ "ticket_id": canonical.0, "flag": flag, "enabled": enabled }))
    }
}

pub struct SendReplyHandler {
    messaging: Arc<dyn MessagingClient>,
}

impl SendReplyHandler {
    pub fn new(messaging: Arc<dyn MessagingClient>) -> Self {
        Self { messaging }
    }
}

#[async_trait]
impl FunctionHandler for SendReplyHandler {
    fn name(&self) -> &'static str {
        functions::SEND_REPLY
    }

    fn dependency(&self) -> &'static str {
        dependency::EMAIL
    }

    async fn invoke(
        &self,
        context: &ProcessingContext,
        arguments: &Value,
    ) -> Result<Value, CallError> {
        let body = required_str(arguments, "body")?;
        let subject = match optional_str(arguments, "subject") {
            Some(subject) => subject.to_owned(),
            None => format!("Re: {}", context.message.subject),
        };

        let reply = OutboundReply {
            to: context.message.sender.clone(),
            subject,
            body: body.to_owned(),
            thread_id: context.message.thread_id.clone(),
        };
        let receipt = self.messaging.send(&reply).await?;

        Ok(json!({ "message_id": receipt.message_id }))
    }
}
