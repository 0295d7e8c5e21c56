//! Reasoning-client boundary and its HTTP implementation.
//!
//! The model is strictly an advisor: it picks the next function call or
//! hands back terminal text with a transition directive. Everything it
//! asks for is validated and executed by the engine, never by the model
//! itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use triago_core::clients::dependency;
use triago_core::config::ReasoningConfig;
use triago_core::errors::CallError;
use triago_core::steps::FunctionSpec;

/// Decoding is pinned so that replaying a conversation takes the same
/// path every time.
const TEMPERATURE: f64 = 0.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    System,
    User,
    Assistant,
}

/// One turn of the per-step conversation fed to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: ConversationRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ConversationRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ConversationRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ConversationRole::Assistant, content: content.into() }
    }
}

/// A function invocation the model asked for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRequest {
    pub function: String,
    pub arguments: Value,
}

/// What the model handed back for one reasoning iteration.
#[derive(Clone, Debug, PartialEq)]
pub enum ReasoningReply {
    FunctionCall(FunctionCallRequest),
    /// Terminal text; its final line must carry the transition directive.
    Text(String),
}

#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn complete(
        &self,
        conversation: &[ConversationTurn],
        functions: &[FunctionSpec],
    ) -> Result<ReasoningReply, CallError>;
}

/// Chat-completions client for any OpenAI-compatible endpoint, local or
/// hosted. The per-call timeout is enforced here and classified as a
/// transient failure, so the resilience policy may retry it.
pub struct HttpReasoningClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    timeout: Duration,
}

impl HttpReasoningClient {
    pub fn new(config: &ReasoningConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: config.timeout(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    async fn post_chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, CallError> {
        let mut builder = self.http.post(self.completions_url()).json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                CallError::Timeout {
                    dependency: dependency::REASONING.to_owned(),
                    timeout: self.timeout,
                }
            } else {
                CallError::Connection {
                    dependency: dependency::REASONING.to_owned(),
                    message: error.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status(dependency::REASONING, status.as_u16(), body));
        }

        response.json::<ChatResponse>().await.map_err(|error| CallError::MalformedResponse {
            dependency: dependency::REASONING.to_owned(),
            message: error.to_string(),
        })
    }
}

#[async_trait]
impl ReasoningClient for HttpReasoningClient {
    async fn complete(
        &self,
        conversation: &[ConversationTurn],
        functions: &[FunctionSpec],
    ) -> Result<ReasoningReply, CallError> {
        let request = ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            messages: conversation,
            tools: functions.iter().map(ToolDeclaration::for_function).collect(),
        };
        debug!(
            event_name = "reasoning.request",
            model = %self.model,
            turns = conversation.len(),
            functions = functions.len(),
            "requesting reasoning iteration"
        );

        let call = self.post_chat(&request);
        let response = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CallError::Timeout {
                    dependency: dependency::REASONING.to_owned(),
                    timeout: self.timeout,
                })
            }
        };

        reply_from_response(response)
    }
}

/// Maps the first choice of a chat response onto a [`ReasoningReply`].
/// A tool call wins over content; an empty message is malformed.
fn reply_from_response(response: ChatResponse) -> Result<ReasoningReply, CallError> {
    let malformed = |message: &str| CallError::MalformedResponse {
        dependency: dependency::REASONING.to_owned(),
        message: message.to_owned(),
    };

    let choice = response.choices.into_iter().next().ok_or_else(|| malformed("no choices"))?;

    if let Some(tool_call) = choice.message.tool_calls.into_iter().next() {
        let arguments: Value = serde_json::from_str(&tool_call.function.arguments)
            .map_err(|error| malformed(&format!("unparseable tool arguments: {error}")))?;
        return Ok(ReasoningReply::FunctionCall(FunctionCallRequest {
            function: tool_call.function.name,
            arguments,
        }));
    }

    match choice.message.content {
        Some(content) if !content.trim().is_empty() => Ok(ReasoningReply::Text(content)),
        _ => Err(malformed("message carries neither tool call nor content")),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f64,
    messages: &'a [ConversationTurn],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclaration<'a>>,
}

#[derive(Serialize)]
struct ToolDeclaration<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionDeclaration<'a>,
}

impl<'a> ToolDeclaration<'a> {
    fn for_function(spec: &'a FunctionSpec) -> Self {
        Self {
            kind: "function",
            function: FunctionDeclaration {
                name: &spec.name,
                description: &spec.description,
                parameters: &spec.parameters,
            },
        }
    }
}

#[derive(Serialize)]
struct FunctionDeclaration<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: ToolCallFunction,
}

#[derive(Deserialize)]
struct ToolCallFunction {
    name: String,
    /// JSON object encoded as a string, per the chat-completions wire
    /// format.
    arguments: String,
}

/// Replays a fixed sequence of replies. Backs the `replay` command and
/// the engine's test harnesses; one scripted entry is consumed per
/// reasoning call, including retried ones.
pub struct ScriptedReasoningClient {
    replies: Mutex<VecDeque<Result<ReasoningReply, CallError>>>,
    calls: AtomicU32,
}

impl ScriptedReasoningClient {
    pub fn new(replies: impl IntoIterator<Item = Result<ReasoningReply, CallError>>) -> Self {
        Self { replies: Mutex::new(replies.into_iter().collect()), calls: AtomicU32::new(0) }
    }

    /// Total reasoning calls observed, retries included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

#[async_trait]
impl ReasoningClient for ScriptedReasoningClient {
    async fn complete(
        &self,
        _conversation: &[ConversationTurn],
        _functions: &[FunctionSpec],
    ) -> Result<ReasoningReply, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut replies = self.replies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        replies.pop_front().unwrap_or_else(|| {
            Err(CallError::MalformedResponse {
                dependency: dependency::REASONING.to_owned(),
                message: "reasoning script exhausted".to_owned(),
            })
        })
    }
}
