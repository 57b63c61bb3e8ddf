//! Anthropic adapter — `x-api-key` auth, Messages API wire format.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use tracing::{debug, error};

use crate::llm::traits::{ByteStream, KeyFunc, ProbeOutcome, Sender};
use crate::llm::{
    AdapterError, ChatRequest, ClassifiedError, ErrorClass, MessageRole, ProviderResponse,
    TokenUsage,
};

use super::config::{AnthropicConfig, DEFAULT_MAX_TOKENS};
use super::types::{AnthropicErrorBody, AnthropicMessage, AnthropicRequest, AnthropicResponse};

/// Body markers Anthropic uses for over-length prompts.
const CONTEXT_MARKERS: &[&str] = &["prompt is too long", "context length"];

pub struct AnthropicAdapter {
    id: String,
    client: Client,
    config: AnthropicConfig,
    key_fn: KeyFunc,
}

impl AnthropicAdapter {
    pub fn new(id: String, config: AnthropicConfig, key_fn: KeyFunc) -> Self {
        Self {
            id,
            client: Client::new(),
            config,
            key_fn,
        }
    }

    /// Headers for the current request. An empty key omits `x-api-key`.
    fn build_headers(&self) -> std::result::Result<HeaderMap, AdapterError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "anthropic-version",
            HeaderValue::from_str(&self.config.api_version)
                .map_err(|e| AdapterError::Network(format!("invalid api version: {}", e)))?,
        );
        let key = (self.key_fn)();
        if !key.is_empty() {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(&key)
                    .map_err(|e| AdapterError::Network(format!("invalid API key format: {}", e)))?,
            );
        }
        Ok(headers)
    }

    /// System messages move to the request-level `system` field; the
    /// remainder become the message list.
    fn convert_request(&self, model: &str, request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let mut system = None;
        let mut messages: Vec<AnthropicMessage> = Vec::new();
        for msg in &request.messages {
            match msg.role {
                MessageRole::System => system = Some(msg.content.clone()),
                _ => messages.push(msg.into()),
            }
        }

        AnthropicRequest {
            model: model.to_string(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            temperature: request.temperature,
            stream: stream.then_some(true),
        }
    }

    fn convert_response(&self, response: AnthropicResponse) -> ProviderResponse {
        let content = response.text();
        ProviderResponse {
            id: response.id,
            model: response.model,
            provider_id: self.id.clone(),
            content,
            finish_reason: response.stop_reason,
            usage: TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
        }
    }

    async fn post_messages(
        &self,
        model: &str,
        request: &ChatRequest,
        deadline: Option<Duration>,
        stream: bool,
    ) -> std::result::Result<reqwest::Response, AdapterError> {
        let headers = self.build_headers()?;
        let body = self.convert_request(model, request, stream);
        let url = format!("{}/v1/messages", self.config.base_url);
        let timeout = deadline.unwrap_or(Duration::from_secs(self.config.timeout_secs));

        debug!(url = %url, model = %model, stream, "anthropic request");

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, "anthropic error response");
            return Err(AdapterError::Http { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl Sender for AnthropicAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(
        &self,
        model: &str,
        request: &ChatRequest,
        deadline: Option<Duration>,
    ) -> std::result::Result<ProviderResponse, AdapterError> {
        let response = self.post_messages(model, request, deadline, false).await?;
        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Serialization(e.to_string()))?;
        Ok(self.convert_response(parsed))
    }

    fn classify_error(&self, err: &AdapterError) -> ClassifiedError {
        let (class, message) = match err {
            AdapterError::Http { status, body } => {
                let message = parse_error_message(body);
                let class = match *status {
                    401 | 403 => ErrorClass::Auth,
                    429 => ErrorClass::RateLimited,
                    400 if CONTEXT_MARKERS.iter().any(|m| body.contains(m)) => {
                        ErrorClass::ContextTooLong
                    }
                    400..=499 => ErrorClass::Fatal,
                    // 529 "overloaded" lands here with the 5xx family.
                    _ => ErrorClass::Retryable,
                };
                (class, message)
            }
            AdapterError::Network(msg) => (ErrorClass::Retryable, msg.clone()),
            AdapterError::Timeout => (ErrorClass::Retryable, "request timed out".to_string()),
            AdapterError::Serialization(msg) => (ErrorClass::Fatal, msg.clone()),
            AdapterError::Stream(msg) => (ErrorClass::Retryable, msg.clone()),
        };
        ClassifiedError {
            class,
            message,
            http_status: err.http_status(),
        }
    }

    async fn stream(
        &self,
        model: &str,
        request: &ChatRequest,
        deadline: Option<Duration>,
    ) -> std::result::Result<ByteStream, AdapterError> {
        let response = self.post_messages(model, request, deadline, true).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| AdapterError::Stream(e.to_string())));
        Ok(Box::pin(stream))
    }

    /// Anthropic has no cheap unauthenticated endpoint; probe with a
    /// minimal one-token message and treat any well-formed HTTP reply
    /// (including auth failures) as the service being up.
    async fn probe(&self) -> ProbeOutcome {
        let probe_request = ChatRequest {
            max_tokens: Some(1),
            ..ChatRequest::new(vec![crate::llm::ChatMessage::user("ping")])
        };
        match self
            .post_messages(
                "claude-3-5-haiku-latest",
                &probe_request,
                Some(Duration::from_secs(self.config.probe_timeout_secs)),
                false,
            )
            .await
        {
            Ok(_) => ProbeOutcome::Up,
            Err(AdapterError::Http { status, .. }) if status < 500 => ProbeOutcome::Up,
            Err(e) => ProbeOutcome::Down(e.to_string()),
        }
    }
}

fn parse_error_message(body: &str) -> String {
    serde_json::from_str::<AnthropicErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| {
            let mut end = body.len().min(200);
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body[..end].to_string()
        })
}
