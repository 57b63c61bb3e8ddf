//! OpenAI adapter configuration.

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Normalized base URL without the `/v1` suffix; the client appends
    /// its own versioned paths.
    pub base_url: String,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            timeout_secs: 30,
            probe_timeout_secs: 10,
        }
    }
}

impl OpenAiConfig {
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            base_url,
            ..Default::default()
        }
    }
}
