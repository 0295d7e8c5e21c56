use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use triago_core::domain::InboundMessage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("mailbox connect failed: {0}")]
    Connect(String),
    #[error("mailbox read failed: {0}")]
    Receive(String),
    #[error("mailbox mark-handled failed: {0}")]
    MarkHandled(String),
    #[error("mailbox disconnect failed: {0}")]
    Disconnect(String),
}

/// Backoff schedule for reconnecting a failed mailbox transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Source of inbound support mail. `next_message` yields `None` when
/// the inbox is currently empty; a handled message must be marked so
/// later polls skip it.
#[async_trait]
pub trait MailboxTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn next_message(&self) -> Result<Option<InboundMessage>, TransportError>;
    async fn mark_handled(&self, message_id: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[derive(Default)]
pub struct NoopMailboxTransport;

#[async_trait]
impl MailboxTransport for NoopMailboxTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_message(&self) -> Result<Option<InboundMessage>, TransportError> {
        Ok(None)
    }

    async fn mark_handled(&self, _message_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
