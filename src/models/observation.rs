//! Per-request observation facts and token-bucket stratification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable per-request fact recorded by the observability sink.
/// Doubles as the durable request-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub request_id: Uuid,
    pub api_key_id: Option<String>,
    pub model_id: String,
    pub provider_id: String,
    pub mode: String,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub success: bool,
    pub error_class: Option<String>,
    pub http_status: Option<u16>,
    pub reason: String,
    pub token_bucket: String,
    /// Scalar in [0, 1] derived from success, latency and cost.
    pub reward: f64,
    pub timestamp: DateTime<Utc>,
}

/// Coarse bucket for estimated input tokens. Stratifies reward statistics
/// so Thompson posteriors are not dominated by one request size.
pub fn token_bucket(estimated_input_tokens: u32) -> &'static str {
    match estimated_input_tokens {
        0..=1023 => "small",
        1024..=8191 => "medium",
        8192..=32767 => "large",
        _ => "xlarge",
    }
}

/// Default latency budget per bucket, used to normalize latency when the
/// request policy carries no deadline of its own.
pub fn bucket_latency_budget_ms(bucket: &str) -> u64 {
    match bucket {
        "small" => 10_000,
        "medium" => 30_000,
        "large" => 60_000,
        _ => 120_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(token_bucket(0), "small");
        assert_eq!(token_bucket(1023), "small");
        assert_eq!(token_bucket(1024), "medium");
        assert_eq!(token_bucket(8191), "medium");
        assert_eq!(token_bucket(8192), "large");
        assert_eq!(token_bucket(32768), "xlarge");
    }

    #[test]
    fn every_bucket_has_a_latency_budget() {
        for bucket in ["small", "medium", "large", "xlarge"] {
            assert!(bucket_latency_budget_ms(bucket) > 0);
        }
    }
}
