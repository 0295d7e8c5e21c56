//! Outbound collaborator boundaries.
//!
//! The engine only ever talks to backends through these traits; concrete
//! HTTP implementations live in the server and mail crates, and tests
//! substitute scripted fakes.

use async_trait::async_trait;

use crate::domain::{NewTicket, OutboundReply, SentReceipt, TicketId, WarrantyRecord};
use crate::errors::CallError;

/// Dependency names the resilience registry keys its breakers by.
pub mod dependency {
    pub const REASONING: &str = "reasoning";
    pub const EMAIL: &str = "email";
    pub const ENTITLEMENT: &str = "entitlement-lookup";
    pub const TICKETING: &str = "ticketing";
}

/// Function names steps may declare. Part of the step-file contract.
pub mod functions {
    pub const CHECK_WARRANTY: &str = "check_warranty";
    pub const CREATE_TICKET: &str = "create_ticket";
    pub const APPEND_TICKET_NOTE: &str = "append_ticket_note";
    pub const TICKET_FEATURE_FLAG: &str = "ticket_feature_flag";
    pub const SEND_REPLY: &str = "send_reply";
}

/// Warranty/entitlement lookup backend.
#[async_trait]
pub trait EntitlementClient: Send + Sync {
    /// Unknown serials come back as the `NotFound` status, not as an
    /// error; errors mean the lookup itself could not be performed.
    async fn check(&self, serial_number: &str) -> Result<WarrantyRecord, CallError>;
}

/// Ticketing backend.
#[async_trait]
pub trait TicketingClient: Send + Sync {
    /// Returns a negative id when a ticket for the serial already
    /// existed (see [`TicketId::is_preexisting`]).
    async fn create_ticket(&self, ticket: &NewTicket) -> Result<TicketId, CallError>;

    async fn append_note(&self, ticket_id: TicketId, note: &str) -> Result<(), CallError>;

    async fn has_feature_flag(&self, ticket_id: TicketId, flag: &str) -> Result<bool, CallError>;
}

/// Outbound reply delivery.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn send(&self, reply: &OutboundReply) -> Result<SentReceipt, CallError>;
}
