//! Reward computation and the in-memory ledger feeding Thompson sampling.

use dashmap::DashMap;

use crate::models::bucket_latency_budget_ms;

/// Fixed cost-normalization constant: a request costing this much or more
/// contributes zero reward from the cost term.
pub const COST_NORMALIZATION_USD: f64 = 0.10;

/// Reward scalar in [0, 1]:
/// `success · (1 − normalized_latency) · (1 − normalized_cost)`.
///
/// `latency_budget_ms` comes from the request policy when it carries a
/// deadline, else from the per-token-bucket default table.
pub fn reward(success: bool, latency_ms: u64, latency_budget_ms: u64, cost_usd: f64) -> f64 {
    if !success {
        return 0.0;
    }
    let budget = latency_budget_ms.max(1) as f64;
    let norm_latency = (latency_ms as f64 / budget).min(1.0);
    let norm_cost = (cost_usd / COST_NORMALIZATION_USD).min(1.0);
    (1.0 - norm_latency) * (1.0 - norm_cost)
}

/// The latency budget used for normalization.
pub fn latency_budget_ms(policy_max_latency_ms: u64, token_bucket: &str) -> u64 {
    if policy_max_latency_ms > 0 {
        policy_max_latency_ms
    } else {
        bucket_latency_budget_ms(token_bucket)
    }
}

/// Per-(model, token-bucket) success/failure counts backing the Thompson
/// sampler's Beta posteriors.
#[derive(Default)]
pub struct RewardLedger {
    counts: DashMap<(String, String), (u64, u64)>,
}

impl RewardLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model_id: &str, token_bucket: &str, success: bool) {
        let mut entry = self
            .counts
            .entry((model_id.to_string(), token_bucket.to_string()))
            .or_insert((0, 0));
        if success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    /// Beta posterior parameters `(α, β)` for a model in a bucket.
    /// With no history this is Beta(1, 1) — the uniform prior.
    pub fn posterior(&self, model_id: &str, token_bucket: &str) -> (f64, f64) {
        let (successes, failures) = self
            .counts
            .get(&(model_id.to_string(), token_bucket.to_string()))
            .map(|e| *e)
            .unwrap_or((0, 0));
        (1.0 + successes as f64, 1.0 + failures as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
