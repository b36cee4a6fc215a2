//! Chat completion models.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::IndexResult;
use crate::error::IndexError;
use crate::openai::OpenAiClient;

/// Default chat model.
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default completion length cap.
pub const DEFAULT_MAX_TOKENS: u32 = 500;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// OpenAI-compatible chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Generates a reply to a conversation.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Returns the assistant's reply to `messages`.
    async fn complete(&self, messages: &[ChatMessage]) -> IndexResult<String>;

    /// Identifier of the model.
    fn model(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

/// OpenAI `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: OpenAiClient,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChat {
    #[must_use]
    pub fn new(client: OpenAiClient) -> Self {
        Self {
            client,
            model: DEFAULT_CHAT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the temperature, clamped to `0.0..=2.0`.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, messages: &[ChatMessage]) -> IndexResult<String> {
        if messages.is_empty() {
            return Err(IndexError::invalid_input("no messages to complete"));
        }
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let response: ChatCompletionResponse = self
            .client
            .post_json("chat", "chat/completions", &request)
            .await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::invalid_response("chat", "no choices returned"))?;
        if choice.finish_reason.as_deref() == Some("length") {
            tracing::warn!(max_tokens = self.max_tokens, "Chat completion truncated");
        }
        Ok(choice.message.content)
    }

    fn model(&self) -> &str {
        &self.model
    }
}
