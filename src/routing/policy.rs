//! Policy resolution: defaults, side-channel hints, in-band directives.

use std::sync::{Arc, RwLock};

use crate::llm::ChatRequest;
use crate::models::{Policy, PolicyHint};
use crate::storage::RoutingConfig;
use crate::{GatewayError, Result};

use super::directive;

/// Merges configured defaults, the request envelope's [`PolicyHint`], and
/// in-band `@@tokenhub` directives into one validated [`Policy`].
/// Precedence, lowest to highest: defaults → hint → directives.
pub struct PolicyResolver {
    config: Arc<RwLock<RoutingConfig>>,
}

impl PolicyResolver {
    pub fn new(config: Arc<RwLock<RoutingConfig>>) -> Self {
        Self { config }
    }

    /// Resolve the request's policy and strip directives from its
    /// messages. The returned request is what adapters will see.
    pub fn resolve(
        &self,
        request: &ChatRequest,
        hint: Option<&PolicyHint>,
    ) -> Result<(Policy, ChatRequest)> {
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "request has no messages".to_string(),
            ));
        }

        let mut policy = {
            let config = self.config.read().unwrap();
            config.default_policy()
        };

        if let Some(hint) = hint {
            hint.apply(&mut policy);
        }

        let (directives, stripped_messages) = directive::extract(&request.messages)?;
        if let Some(mode) = directives.mode {
            policy.mode = mode;
        }
        if let Some(budget) = directives.max_budget_usd {
            policy.max_budget_usd = budget;
        }
        if let Some(latency) = directives.max_latency_ms {
            policy.max_latency_ms = latency;
        }
        if let Some(weight) = directives.min_weight {
            policy.min_weight = weight;
        }

        policy.validate()?;

        let mut stripped = request.clone();
        stripped.messages = stripped_messages;
        Ok((policy, stripped))
    }
}
