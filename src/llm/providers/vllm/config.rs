//! vLLM adapter configuration.

#[derive(Debug, Clone)]
pub struct VllmConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for VllmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            // Self-hosted inference is slower than the hosted APIs.
            timeout_secs: 120,
            probe_timeout_secs: 5,
        }
    }
}

impl VllmConfig {
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            base_url,
            ..Default::default()
        }
    }
}
