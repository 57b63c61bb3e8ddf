//! vLLM wire format.
//!
//! vLLM serves the OpenAI chat-completions shape; the request/response
//! structs are shared with the OpenAI adapter. Only the health endpoint
//! is vLLM-specific (bare `/health`, empty body on success).

pub use crate::llm::providers::openai::types::{
    OpenAiChatMessage as VllmChatMessage, OpenAiChatRequest as VllmChatRequest,
    OpenAiErrorBody as VllmErrorBody, OpenAiResponse as VllmResponse,
};
