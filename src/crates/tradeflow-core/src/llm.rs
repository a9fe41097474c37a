//! LLM client trait and request/response types.
//!
//! tradeflow is an orchestration runtime, not an LLM client library: the
//! core defines the [`LlmClient`] trait and consumes it through the Tool
//! Invoker; embedders supply an implementation for their provider (the
//! recognized providers are named in [`LlmProvider`](crate::config::LlmProvider)).
//! The trait is deliberately minimal — one async completion call — and
//! implementations must be `Send + Sync` so an `Arc<dyn LlmClient>` can be
//! shared across graph nodes.
//!
//! Implementations must be non-blocking: a client that performs synchronous
//! network I/O on the event loop is a defect and belongs behind
//! [`ToolInvoker::offload`](crate::invoker::ToolInvoker::offload).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::invoker::ErrorClass;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction.
    System,
    /// Caller-provided content.
    User,
    /// Model output (debate history replay).
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who is speaking.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl Message {
    /// System instruction message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request: model, conversation, and generation bounds.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier (quick or deep model from config).
    pub model: String,
    /// Conversation to complete.
    pub messages: Vec<Message>,
    /// Response length cap, if any.
    pub max_tokens: Option<usize>,
    /// Sampling temperature, if the caller wants one.
    pub temperature: Option<f32>,
    /// Per-call timeout; the invoker also bounds the call externally.
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    /// New request for `model` with `messages` and default bounds.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            timeout: None,
        }
    }

    /// Cap the response length.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens in the completion.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Prompt plus completion.
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A completed LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Model output text.
    pub content: String,
    /// Token accounting (zeroed if the provider reports none).
    pub usage: TokenUsage,
}

/// Errors an LLM client may surface. Classification drives the invoker's
/// retry decision: only transient errors retry.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Rate limit, 5xx, connection reset — retryable.
    #[error("transient LLM error: {0}")]
    Transient(String),

    /// Auth failure, 4xx, malformed request — not retryable.
    #[error("permanent LLM error: {0}")]
    Permanent(String),

    /// The provider did not answer within the request timeout.
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
}

impl LlmError {
    /// Retry classification for the invoker.
    pub fn class(&self) -> ErrorClass {
        match self {
            LlmError::Transient(_) | LlmError::Timeout(_) => ErrorClass::Transient,
            LlmError::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// Chat-completion client. The core consumes this; it never implements a
/// real provider (see `tradeflow_core::testing::MockLlm` for the test one).
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete `request` and return the model output with token usage.
    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_sets_bounds() {
        let req = ChatRequest::new("quick", vec![Message::system("sys"), Message::user("hi")])
            .with_max_tokens(512)
            .with_temperature(0.2)
            .with_timeout(Duration::from_secs(30));
        assert_eq!(req.max_tokens, Some(512));
        assert_eq!(req.temperature, Some(0.2));
        assert_eq!(req.messages.len(), 2);
    }

    #[test]
    fn timeout_and_transient_are_retryable_permanent_is_not() {
        assert_eq!(
            LlmError::Transient("429".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            LlmError::Timeout(Duration::from_secs(1)).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            LlmError::Permanent("401".into()).class(),
            ErrorClass::Permanent
        );
    }
}
