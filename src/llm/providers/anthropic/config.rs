//! Anthropic adapter configuration.

pub const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Anthropic requires max_tokens on every request; used when the caller
/// supplies none.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub api_version: String,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout_secs: 30,
            probe_timeout_secs: 10,
        }
    }
}

impl AnthropicConfig {
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            base_url,
            ..Default::default()
        }
    }
}
