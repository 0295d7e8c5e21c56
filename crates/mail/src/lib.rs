//! Mailbox integration - polling ingress and outbound delivery
//!
//! This crate connects triago to the support mailbox:
//! - **Transport** (`transport`) - Pluggable mailbox connection with reconnect backoff
//! - **Poller** (`poller`) - Pulls inbound mail and fans runs out to the engine
//! - **HTTP API** (`api`) - Client for the mailbox relay, inbound and outbound
//!
//! # Architecture
//!
//! ```text
//! Mailbox Relay → MailboxTransport → MailPoller → MessageProcessor (engine)
//!                                        ↓
//!                        mark handled / leave for next start
//! ```
//!
//! A message is marked handled only when its run succeeds. Failed and
//! interrupted runs leave their message in the inbox, so a later poll
//! or a restart picks it up again.
//!
//! # Key Types
//!
//! - `MailPoller` - Bounded-concurrency poll loop with graceful drain
//! - `MailboxTransport` - Trait for mailbox backends
//! - `HttpMailApi` - Relay client serving both transport and reply delivery

pub mod api;
pub mod poller;
pub mod transport;

pub use api::HttpMailApi;
pub use poller::{MailPoller, MessageProcessor, PollerSettings};
pub use transport::{MailboxTransport, NoopMailboxTransport, ReconnectPolicy, TransportError};
