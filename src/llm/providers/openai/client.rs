//! OpenAI adapter — Bearer auth, `/v1/chat/completions` wire format.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use tracing::{debug, error};

use crate::llm::traits::{ByteStream, KeyFunc, ProbeOutcome, Sender};
use crate::llm::{
    AdapterError, ChatRequest, ClassifiedError, ErrorClass, ProviderResponse, TokenUsage,
};

use super::config::OpenAiConfig;
use super::types::{OpenAiChatRequest, OpenAiErrorBody, OpenAiResponse};

/// Body markers OpenAI uses for over-length prompts.
const CONTEXT_MARKERS: &[&str] = &["context_length_exceeded", "maximum context length"];

pub struct OpenAiAdapter {
    id: String,
    client: Client,
    config: OpenAiConfig,
    key_fn: KeyFunc,
}

impl OpenAiAdapter {
    pub fn new(id: String, config: OpenAiConfig, key_fn: KeyFunc) -> Self {
        Self {
            id,
            client: Client::new(),
            config,
            key_fn,
        }
    }

    /// Headers for the current request. The key closure is re-read here
    /// on every call; an empty key omits the Authorization header.
    fn build_headers(&self) -> std::result::Result<HeaderMap, AdapterError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = (self.key_fn)();
        if !key.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|e| AdapterError::Network(format!("invalid API key format: {}", e)))?,
            );
        }
        Ok(headers)
    }

    fn convert_request(&self, model: &str, request: &ChatRequest, stream: bool) -> OpenAiChatRequest {
        OpenAiChatRequest {
            model: model.to_string(),
            messages: request.messages.iter().map(Into::into).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: stream.then_some(true),
            user: request.user.clone(),
        }
    }

    fn convert_response(&self, response: OpenAiResponse) -> ProviderResponse {
        let (content, finish_reason) = response
            .choices
            .into_iter()
            .next()
            .map(|c| (c.message.content, c.finish_reason))
            .unwrap_or_default();

        ProviderResponse {
            id: response.id,
            model: response.model,
            provider_id: self.id.clone(),
            content,
            finish_reason,
            usage: TokenUsage {
                input_tokens: response.usage.prompt_tokens,
                output_tokens: response.usage.completion_tokens,
            },
        }
    }

    async fn post_chat(
        &self,
        model: &str,
        request: &ChatRequest,
        deadline: Option<Duration>,
        stream: bool,
    ) -> std::result::Result<reqwest::Response, AdapterError> {
        let headers = self.build_headers()?;
        let body = self.convert_request(model, request, stream);
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let timeout = deadline.unwrap_or(Duration::from_secs(self.config.timeout_secs));

        debug!(url = %url, model = %model, stream, "openai request");

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
            error!(status, "openai error response");
            return Err(AdapterError::Http { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl Sender for OpenAiAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(
        &self,
        model: &str,
        request: &ChatRequest,
        deadline: Option<Duration>,
    ) -> std::result::Result<ProviderResponse, AdapterError> {
        let response = self.post_chat(model, request, deadline, false).await?;
        let parsed: OpenAiResponse = response
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
        let response = self.post_chat(model, request, deadline, true).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| AdapterError::Stream(e.to_string())));
        Ok(Box::pin(stream))
    }

    async fn probe(&self) -> ProbeOutcome {
        let url = format!("{}/v1/models", self.config.base_url);
        let headers = match self.build_headers() {
            Ok(h) => h,
            Err(e) => return ProbeOutcome::Down(e.to_string()),
        };
        match self
            .client
            .get(&url)
            .headers(headers)
            .timeout(Duration::from_secs(self.config.probe_timeout_secs))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Up,
            Ok(resp) => ProbeOutcome::Down(format!("probe returned HTTP {}", resp.status())),
            Err(e) => ProbeOutcome::Down(e.to_string()),
        }
    }
}

fn parse_error_message(body: &str) -> String {
    serde_json::from_str::<OpenAiErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| truncate(body, 200))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
