//! Chat-completion clients for the hosted and local model back ends.
//!
//! Every client makes exactly one HTTP call per completion. Failures are
//! returned as they come back from the service; nothing here retries.

use crate::error::ServiceError;
use crate::models::{ChatMessage, Role};
use crate::traits::ChatModel;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

pub const OPENAI_CHAT_MODEL: &str = "gpt-4-0125-preview";
pub const ANTHROPIC_CHAT_MODEL: &str = "claude-3-opus-20240229";
pub const OLLAMA_CHAT_MODEL: &str = "mistral:7b-instruct";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ModelSettings {
    pub fn openai() -> Self {
        Self {
            model: OPENAI_CHAT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn anthropic() -> Self {
        Self {
            model: ANTHROPIC_CHAT_MODEL.to_string(),
            temperature: 0.0,
            max_tokens: Some(1024),
        }
    }

    pub fn ollama() -> Self {
        Self {
            model: OLLAMA_CHAT_MODEL.to_string(),
            temperature: 0.0,
            max_tokens: Some(1024),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

fn require_key(api_key: Option<String>, variable: &str) -> Result<String, ServiceError> {
    api_key
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ServiceError::MissingCredential(variable.to_string()))
}

async fn send_json(
    backend: &str,
    request: RequestBuilder,
    body: &Value,
) -> Result<Value, ServiceError> {
    let response: Response = request
        .header("content-type", "application/json")
        .json(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ServiceError::status(backend, status, &body));
    }

    Ok(response.json().await?)
}

fn malformed(backend: &str, details: impl Into<String>) -> ServiceError {
    ServiceError::Malformed {
        backend: backend.to_string(),
        details: details.into(),
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|message| WireMessage {
            role: message.role.as_str(),
            content: &message.content,
        })
        .collect()
}

pub struct OpenAiChatModel {
    endpoint: String,
    api_key: String,
    settings: ModelSettings,
    client: Client,
}

impl OpenAiChatModel {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        settings: ModelSettings,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: require_key(api_key, "OPENAI_API_KEY")?,
            settings,
            client: Client::new(),
        })
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        let mut body = json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "messages": wire_messages(messages),
        });
        if let Some(max_tokens) = self.settings.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

fn parse_openai_reply(payload: &Value) -> Result<String, ServiceError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| malformed("openai", "response has no choices[0].message.content"))
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        debug!(model = %self.settings.model, messages = messages.len(), "openai completion");
        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key);
        let payload = send_json("openai", request, &self.request_body(messages)).await?;
        parse_openai_reply(&payload)
    }
}

pub struct AnthropicChatModel {
    endpoint: String,
    api_key: String,
    settings: ModelSettings,
    client: Client,
}

impl AnthropicChatModel {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        settings: ModelSettings,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: require_key(api_key, "ANTHROPIC_API_KEY")?,
            settings,
            client: Client::new(),
        })
    }

    /// System messages travel in the top-level `system` field; the rest must
    /// start with a user turn and alternate user/assistant.
    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        let (system, turns) = anthropic_turns(messages);
        let conversation: Vec<Value> = turns
            .iter()
            .map(|(role, text)| {
                json!({
                    "role": role.as_str(),
                    "content": [{ "type": "text", "text": text }],
                })
            })
            .collect();

        let mut body = json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens.unwrap_or(1024),
            "messages": conversation,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        body
    }
}

/// Splits messages into the system text and an alternating turn list.
/// Assistant turns before the first user turn (a greeting, an agent's own
/// opening line) are folded into the system text; consecutive turns of the
/// same role are joined.
fn anthropic_turns(messages: &[ChatMessage]) -> (String, Vec<(Role, String)>) {
    let mut system: Vec<String> = Vec::new();
    let mut turns: Vec<(Role, String)> = Vec::new();

    for message in messages {
        match message.role {
            Role::System => system.push(message.content.clone()),
            Role::Assistant if turns.is_empty() => {
                system.push(format!("You already said: {}", message.content));
            }
            role => match turns.last_mut() {
                Some((last, text)) if *last == role => {
                    text.push_str("\n\n");
                    text.push_str(&message.content);
                }
                _ => turns.push((role, message.content.clone())),
            },
        }
    }

    (system.join("\n\n"), turns)
}

fn parse_anthropic_reply(payload: &Value) -> Result<String, ServiceError> {
    let blocks = payload
        .pointer("/content")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("anthropic", "response has no content blocks"))?;

    let text = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<String>();

    if text.is_empty() {
        return Err(malformed("anthropic", "response has no text block"));
    }
    Ok(text.trim().to_string())
}

#[async_trait]
impl ChatModel for AnthropicChatModel {
    fn model_name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        debug!(model = %self.settings.model, messages = messages.len(), "anthropic completion");
        let request = self
            .client
            .post(format!("{}/v1/messages", self.endpoint))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        let payload = send_json("anthropic", request, &self.request_body(messages)).await?;
        parse_anthropic_reply(&payload)
    }
}

pub struct OllamaChatModel {
    endpoint: String,
    settings: ModelSettings,
    client: Client,
}

impl OllamaChatModel {
    pub fn new(endpoint: impl Into<String>, settings: ModelSettings) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            settings,
            client: Client::new(),
        }
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        let mut options = json!({ "temperature": self.settings.temperature });
        if let Some(max_tokens) = self.settings.max_tokens {
            options["num_predict"] = json!(max_tokens);
        }

        json!({
            "model": self.settings.model,
            "stream": false,
            "messages": wire_messages(messages),
            "options": options,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OllamaReply {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

fn parse_ollama_reply(payload: Value) -> Result<String, ServiceError> {
    let reply: OllamaReply = serde_json::from_value(payload)?;
    Ok(reply.message.content.trim().to_string())
}

#[async_trait]
impl ChatModel for OllamaChatModel {
    fn model_name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        debug!(model = %self.settings.model, messages = messages.len(), "ollama completion");
        let request = self.client.post(format!("{}/api/chat", self.endpoint));
        let payload = send_json("ollama", request, &self.request_body(messages)).await?;
        parse_ollama_reply(payload)
    }
}

#[async_trait]
impl<T> ChatModel for Box<T>
where
    T: ChatModel + Send + Sync + ?Sized,
{
    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        (**self).complete(messages).await
    }
}
