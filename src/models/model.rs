//! Model catalog — the unit of routing and its metadata.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{GatewayError, Result};

/// How a model's pricing fields were populated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PricingSource {
    Manual,
    Auto,
}

/// A routable model bound to a registered provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    /// Refers to a registered adapter; need not reference a persisted
    /// provider record (ad-hoc adapters are legal).
    pub provider_id: String,
    /// Quality prior in [0, 10].
    pub weight: f64,
    pub max_context_tokens: u32,
    /// USD per 1000 input tokens.
    pub input_per_1k: f64,
    /// USD per 1000 output tokens.
    pub output_per_1k: f64,
    pub enabled: bool,
    pub pricing_source: PricingSource,
}

impl Model {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(GatewayError::InvalidRequest("model id is empty".into()));
        }
        if self.provider_id.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "model {} has no provider_id",
                self.id
            )));
        }
        if !(0.0..=10.0).contains(&self.weight) {
            return Err(GatewayError::InvalidRequest(format!(
                "model {} weight {} outside [0, 10]",
                self.id, self.weight
            )));
        }
        if self.input_per_1k < 0.0 || self.output_per_1k < 0.0 {
            return Err(GatewayError::InvalidRequest(format!(
                "model {} has negative pricing",
                self.id
            )));
        }
        Ok(())
    }

    /// Estimated request cost in USD for the given token counts.
    pub fn estimate_cost(&self, input_tokens: u32, expected_output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (expected_output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Thread-safe catalog of known models. Read-heavy: every request lists
/// enabled models; writers are rare admin mutations.
#[derive(Default)]
pub struct ModelCatalog {
    models: RwLock<HashMap<String, Model>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a model. The caller validates first.
    pub fn upsert(&self, model: Model) {
        let mut models = self.models.write().unwrap();
        models.insert(model.id.clone(), model);
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut models = self.models.write().unwrap();
        models.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Model> {
        let models = self.models.read().unwrap();
        models.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Model> {
        let models = self.models.read().unwrap();
        let mut all: Vec<Model> = models.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Enabled models only — the selector's candidate pool.
    pub fn enabled(&self) -> Vec<Model> {
        let models = self.models.read().unwrap();
        let mut enabled: Vec<Model> = models.values().filter(|m| m.enabled).cloned().collect();
        enabled.sort_by(|a, b| a.id.cmp(&b.id));
        enabled
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
