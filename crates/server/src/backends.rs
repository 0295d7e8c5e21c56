//! HTTP clients for the warranty and ticketing backends.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use triago_core::clients::{dependency, EntitlementClient, TicketingClient};
use triago_core::config::{EntitlementConfig, TicketingConfig};
use triago_core::domain::{NewTicket, TicketId, WarrantyRecord};
use triago_core::errors::CallError;

pub struct HttpEntitlementClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl HttpEntitlementClient {
    pub fn new(config: &EntitlementConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl EntitlementClient for HttpEntitlementClient {
    async fn check(&self, serial_number: &str) -> Result<WarrantyRecord, CallError> {
        let mut builder =
            self.http.get(format!("{}/api/v1/warranty/{serial_number}", self.base_url));
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }
        let response = request(dependency::ENTITLEMENT, self.timeout, builder.send()).await?;

        if response.status() == StatusCode::NOT_FOUND {
            // An unknown serial is a business outcome, not a dependency
            // failure.
            return Ok(WarrantyRecord::not_found());
        }
        let response = ensure_success(dependency::ENTITLEMENT, response).await?;
        decode(dependency::ENTITLEMENT, response).await
    }
}

pub struct HttpTicketingClient {
    http: reqwest::Client,
    base_url: String,
    api_token: SecretString,
    timeout: Duration,
}

impl HttpTicketingClient {
    pub fn new(config: &TicketingConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_token: config.api_token.clone(),
            timeout: config.timeout(),
        }
    }
}

#[derive(Deserialize)]
struct CreatedTicket {
    ticket_id: i64,
}

#[derive(Deserialize)]
struct FlagAnswer {
    enabled: bool,
}

#[async_trait]
impl TicketingClient for HttpTicketingClient {
    async fn create_ticket(&self, ticket: &NewTicket) -> Result<TicketId, CallError> {
        let sending = self
            .http
            .post(format!("{}/api/v1/tickets", self.base_url))
            .bearer_auth(self.api_token.expose_secret())
            .json(ticket)
            .send();
        let response = request(dependency::TICKETING, self.timeout, sending).await?;
        let response = ensure_success(dependency::TICKETING, response).await?;
        let created: CreatedTicket = decode(dependency::TICKETING, response).await?;
        Ok(TicketId(created.ticket_id))
    }

    async fn append_note(&self, ticket_id: TicketId, note: &str) -> Result<(), CallError> {
        let sending = self
            .http
            .post(format!("{}/api/v1/tickets/{}/notes", self.base_url, ticket_id.0))
            .bearer_auth(self.api_token.expose_secret())
            .json(&json!({ "note": note }))
            .send();
        let response = request(dependency::TICKETING, self.timeout, sending).await?;
        ensure_success(dependency::TICKETING, response).await?;
        Ok(())
    }

    async fn has_feature_flag(&self, ticket_id: TicketId, flag: &str) -> Result<bool, CallError> {
        let sending = self
            .http
            .get(format!("{}/api/v1/tickets/{}/flags/{flag}", self.base_url, ticket_id.0))
            .bearer_auth(self.api_token.expose_secret())
            .send();
        let response = request(dependency::TICKETING, self.timeout, sending).await?;
        let response = ensure_success(dependency::TICKETING, response).await?;
        let answer: FlagAnswer = decode(dependency::TICKETING, response).await?;
        Ok(answer.enabled)
    }
}

async fn request(
    dependency_name: &str,
    timeout: Duration,
    sending: impl Future<Output = Result<reqwest::Response, reqwest::Error>>,
) -> Result<reqwest::Response, CallError> {
    match tokio::time::timeout(timeout, sending).await {
        Ok(sent) => sent.map_err(|error| {
            if error.is_timeout() {
                CallError::Timeout { dependency: dependency_name.to_owned(), timeout }
            } else {
                CallError::Connection {
                    dependency: dependency_name.to_owned(),
                    message: error.to_string(),
                }
            }
        }),
        Err(_) => Err(CallError::Timeout { dependency: dependency_name.to_owned(), timeout }),
    }
}

async fn ensure_success(
    dependency_name: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CallError::from_status(dependency_name, status.as_u16(), body))
}

async fn decode<T: serde::de::DeserializeOwned>(
    dependency_name: &str,
    response: reqwest::Response,
) -> Result<T, CallError> {
    response.json::<T>().await.map_err(|error| CallError::MalformedResponse {
        dependency: dependency_name.to_owned(),
        message: error.to_string(),
    })
}
