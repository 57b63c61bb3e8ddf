//! Routing decisions — the selector's output.

use serde::{Deserialize, Serialize};

/// The outcome of model selection: which model on which provider at what
/// estimated cost, with a human-readable rationale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub model_id: String,
    pub provider_id: String,
    pub estimated_cost_usd: f64,
    /// Cites the chosen mode and the decisive factor, e.g.
    /// `"cheap: lowest estimated cost among 3 eligible"`.
    pub reason: String,
}
