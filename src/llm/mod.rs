//! LLM wire types shared by all provider adapters.
//!
//! A [`ChatRequest`] is the normalized inbound shape; adapters convert it
//! to their provider's wire format and normalize the reply back into a
//! [`ProviderResponse`]. Adapter failures surface as [`AdapterError`] and
//! are mapped to one of five [`ErrorClass`] variants by the adapter that
//! produced them.

pub mod providers;
pub mod registry;
pub mod traits;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message roles in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Normalized chat request, provider-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub id: Uuid,
    /// The authenticated API key identity, when known. Drives budget
    /// enforcement and observation attribution.
    pub api_key_id: Option<String>,
    /// When present and eligible, short-circuits model selection.
    pub model_hint: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Caller-supplied output-size hint for cost estimation.
    pub expected_output_tokens: Option<u32>,
    pub user: Option<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            api_key_id: None,
            model_hint: None,
            messages,
            max_tokens: None,
            temperature: None,
            expected_output_tokens: None,
            user: None,
        }
    }

    /// Rough input-token estimate: ~4 characters per token.
    pub fn estimated_input_tokens(&self) -> u32 {
        let chars: usize = self.messages.iter().map(|m| m.content.len()).sum();
        (chars / 4) as u32
    }
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Normalized provider reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Provider-assigned response id.
    pub id: String,
    pub model: String,
    pub provider_id: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
}

/// The five-way classification every adapter maps its failures into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Do not retry; the request itself cannot succeed.
    Fatal,
    /// Transient; another attempt may succeed.
    Retryable,
    RateLimited,
    /// Credential missing, invalid, or rejected.
    Auth,
    ContextTooLong,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Fatal => "fatal",
            ErrorClass::Retryable => "retryable",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Auth => "auth",
            ErrorClass::ContextTooLong => "context_too_long",
        }
    }

    /// Whether the dispatcher may re-run selection after this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorClass::Retryable | ErrorClass::RateLimited)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An adapter failure after classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,
    pub http_status: Option<u16>,
}

/// Raw adapter failure, before the owning adapter classifies it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request deadline exceeded")]
    Timeout,

    #[error("response decode error: {0}")]
    Serialization(String),

    #[error("stream error: {0}")]
    Stream(String),
}

impl AdapterError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout
        } else if err.is_decode() {
            AdapterError::Serialization(err.to_string())
        } else {
            AdapterError::Network(err.to_string())
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            AdapterError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_token_estimate_uses_four_chars_per_token() {
        let req = ChatRequest::new(vec![
            ChatMessage::system("a".repeat(100)),
            ChatMessage::user("b".repeat(300)),
        ]);
        assert_eq!(req.estimated_input_tokens(), 100);
    }

    #[test]
    fn error_class_recoverability() {
        assert!(ErrorClass::Retryable.is_recoverable());
        assert!(ErrorClass::RateLimited.is_recoverable());
        assert!(!ErrorClass::Fatal.is_recoverable());
        assert!(!ErrorClass::Auth.is_recoverable());
        assert!(!ErrorClass::ContextTooLong.is_recoverable());
    }
}
