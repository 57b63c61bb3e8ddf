//! Gateway configuration and tracing initialization.

use serde::Deserialize;

use crate::{GatewayError, Result};

/// Tunables for the gateway core. Every field has a default; any of them
/// can be overridden through `TOKENHUB_*` environment variables (e.g.
/// `TOKENHUB_QUEUE_CAPACITY=4096`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bounded durable-write queue capacity.
    pub queue_capacity: usize,
    /// Total dispatch attempts per request, including the first.
    pub max_attempts: u32,
    /// Output-size assumption when the caller gives no hint.
    pub default_expected_output_tokens: u32,
    /// Streaming byte guard.
    pub max_stream_bytes: u64,
    pub probe_interval_secs: u64,
    pub budget_cache_ttl_secs: u64,
    pub event_bus_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 2,
            default_expected_output_tokens: 256,
            max_stream_bytes: 16 * 1024 * 1024,
            probe_interval_secs: 60,
            budget_cache_ttl_secs: 30,
            event_bus_capacity: 1024,
        }
    }
}

impl GatewayConfig {
    /// Defaults overlaid with `TOKENHUB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let source = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TOKENHUB").try_parsing(true),
            )
            .build()
            .map_err(|e| GatewayError::Internal(format!("config: {}", e)))?;
        source
            .try_deserialize()
            .map_err(|e| GatewayError::Internal(format!("config: {}", e)))
    }
}

/// Install the global tracing subscriber, honoring `RUST_LOG`. Safe to
/// call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
