use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use triago_core::clients::{dependency, MessagingClient};
use triago_core::config::MailboxConfig;
use triago_core::domain::{InboundMessage, OutboundReply, SentReceipt};
use triago_core::errors::CallError;

use crate::transport::{MailboxTransport, TransportError};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the mailbox relay. One instance serves both sides:
/// it is the poller's inbound transport and the engine's outbound
/// messaging client.
pub struct HttpMailApi {
    http: reqwest::Client,
    base_url: String,
    api_token: SecretString,
}

impl HttpMailApi {
    pub fn new(config: &MailboxConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_token: config.api_token.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl MailboxTransport for HttpMailApi {
    async fn connect(&self) -> Result<(), TransportError> {
        let response = self
            .http
            .get(self.url("/api/v1/health"))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Connect(format!(
                "mailbox health returned {}",
                response.status()
            )))
        }
    }

    async fn next_message(&self) -> Result<Option<InboundMessage>, TransportError> {
        let response = self
            .http
            .get(self.url("/api/v1/inbox/next"))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|error| TransportError::Receive(error.to_string()))?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(TransportError::Receive(format!(
                "inbox poll returned {}",
                response.status()
            )));
        }
        let message = response
            .json::<InboundMessage>()
            .await
            .map_err(|error| TransportError::Receive(error.to_string()))?;
        Ok(Some(message))
    }

    async fn mark_handled(&self, message_id: &str) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.url(&format!("/api/v1/inbox/{message_id}/handled")))
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|error| TransportError::MarkHandled(error.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::MarkHandled(format!(
                "mark-handled returned {}",
                response.status()
            )))
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        // Stateless HTTP; nothing to tear down.
        Ok(())
    }
}

#[async_trait]
impl MessagingClient for HttpMailApi {
    async fn send(&self, reply: &OutboundReply) -> Result<SentReceipt, CallError> {
        let request = self
            .http
            .post(self.url("/api/v1/outbox"))
            .bearer_auth(self.api_token.expose_secret())
            .json(reply)
            .send();

        let response = match tokio::time::timeout(SEND_TIMEOUT, request).await {
            Ok(sent) => sent.map_err(|error| {
                if error.is_timeout() {
                    CallError::Timeout {
                        dependency: dependency::EMAIL.to_owned(),
                        timeout: SEND_TIMEOUT,
                    }
                } else {
                    CallError::Connection {
                        dependency: dependency::EMAIL.to_owned(),
                        message: error.to_string(),
                    }
                }
            })?,
            Err(_) => {
                return Err(CallError::Timeout {
                    dependency: dependency::EMAIL.to_owned(),
                    timeout: SEND_TIMEOUT,
                })
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status(dependency::EMAIL, status.as_u16(), body));
        }
        response.json::<SentReceipt>().await.map_err(|error| CallError::MalformedResponse {
            dependency: dependency::EMAIL.to_owned(),
            message: error.to_string(),
        })
    }
}
