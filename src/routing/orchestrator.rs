//! Multi-iteration plan modes: planning, adversarial, vote, refine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::llm::registry::AdapterRegistry;
use crate::llm::{ChatMessage, ChatRequest, ProviderResponse, TokenUsage};
use crate::models::{Decision, Policy, RouteMode};
use crate::routing::dispatcher::Dispatcher;
use crate::{GatewayError, Result};

pub const MAX_ITERATIONS: u32 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    Planning,
    Adversarial,
    Vote,
    Refine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationDirective {
    pub mode: OrchestrationMode,
    pub iterations: u32,
}

/// Drives repeated dispatches for the plan modes. Each underlying
/// dispatch records its own observation; the orchestrator only shapes
/// requests and merges responses.
pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<AdapterRegistry>,
}

impl Orchestrator {
    pub fn new(dispatcher: Arc<Dispatcher>, registry: Arc<AdapterRegistry>) -> Self {
        Self {
            dispatcher,
            registry,
        }
    }

    pub async fn orchestrate(
        &self,
        request: &ChatRequest,
        policy: &Policy,
        directive: &OrchestrationDirective,
    ) -> Result<(Decision, ProviderResponse)> {
        if directive.iterations > MAX_ITERATIONS {
            return Err(GatewayError::InvalidRequest(format!(
                "iterations {} outside [0, {}]",
                directive.iterations, MAX_ITERATIONS
            )));
        }
        if directive.iterations == 0 && directive.mode != OrchestrationMode::Planning {
            return Err(GatewayError::InvalidRequest(
                "iterations must be at least 1 for this mode".to_string(),
            ));
        }

        match directive.mode {
            OrchestrationMode::Planning => self.run_planning(request, policy).await,
            OrchestrationMode::Adversarial => {
                self.run_adversarial(request, policy, directive.iterations).await
            }
            OrchestrationMode::Vote => self.run_vote(request, policy, directive.iterations).await,
            OrchestrationMode::Refine => {
                self.run_refine(request, policy, directive.iterations).await
            }
        }
    }

    /// A single high-confidence call.
    async fn run_planning(
        &self,
        request: &ChatRequest,
        policy: &Policy,
    ) -> Result<(Decision, ProviderResponse)> {
        let mut planning_policy = policy.clone();
        planning_policy.mode = RouteMode::Planning;
        self.dispatcher.route_and_send(request, &planning_policy).await
    }

    /// N calls rotated across distinct providers; the annotated record of
    /// every completed iteration is returned as one response.
    async fn run_adversarial(
        &self,
        request: &ChatRequest,
        policy: &Policy,
        iterations: u32,
    ) -> Result<(Decision, ProviderResponse)> {
        let mut adversarial_policy = policy.clone();
        adversarial_policy.mode = RouteMode::Adversarial;

        let mut used_providers: HashSet<String> = HashSet::new();
        let mut completed: Vec<(u32, Decision, ProviderResponse)> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        for iteration in 1..=iterations {
            match self
                .dispatcher
                .dispatch(request, &adversarial_policy, &used_providers)
                .await
            {
                Ok((decision, response)) => {
                    used_providers.insert(decision.provider_id.clone());
                    completed.push((iteration, decision, response));
                }
                Err(e) => {
                    if is_fatal(&e) {
                        return Err(e);
                    }
                    warn!(iteration, error = %e, "adversarial iteration failed; continuing");
                    last_error = Some(e);
                }
            }
        }

        let Some((_, first_decision, first_response)) = completed.first().cloned() else {
            return Err(last_error.unwrap_or_else(|| {
                GatewayError::NoEligibleModel("no adversarial iteration completed".to_string())
            }));
        };

        let mut content = String::new();
        let mut usage = TokenUsage::default();
        for (iteration, decision, response) in &completed {
            content.push_str(&format!(
                "=== iteration {} — {} via {} ({}) ===\n{}\n\n",
                iteration, decision.model_id, decision.provider_id, decision.reason,
                response.content
            ));
            usage.input_tokens += response.usage.input_tokens;
            usage.output_tokens += response.usage.output_tokens;
        }

        Ok((
            first_decision,
            ProviderResponse {
                id: first_response.id,
                model: first_response.model,
                provider_id: first_response.provider_id,
                content,
                finish_reason: Some("adversarial_complete".to_string()),
                usage,
            },
        ))
    }

    /// N parallel calls; the majority answer by normalized-content hash
    /// wins, ties broken by lowest total estimated cost.
    async fn run_vote(
        &self,
        request: &ChatRequest,
        policy: &Policy,
        iterations: u32,
    ) -> Result<(Decision, ProviderResponse)> {
        let calls = (0..iterations).map(|_| self.dispatcher.route_and_send(request, policy));
        let outcomes = join_all(calls).await;

        let mut completed: Vec<(Decision, ProviderResponse)> = Vec::new();
        let mut last_error: Option<GatewayError> = None;
        for outcome in outcomes {
            match outcome {
                Ok(pair) => completed.push(pair),
                Err(e) => {
                    if is_fatal(&e) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }
        if completed.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                GatewayError::NoEligibleModel("no vote iteration completed".to_string())
            }));
        }

        // Group by normalized-content hash.
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, (_, response)) in completed.iter().enumerate() {
            groups
                .entry(content_hash(&response.content))
                .or_default()
                .push(idx);
        }

        let winner_indices = groups
            .values()
            .max_by(|a, b| {
                a.len().cmp(&b.len()).then_with(|| {
                    // Tie: the cheaper group wins. Reverse because
                    // max_by keeps the greater element.
                    let cost = |idxs: &[usize]| -> f64 {
                        idxs.iter()
                            .map(|&i| completed[i].0.estimated_cost_usd)
                            .sum()
                    };
                    cost(b).total_cmp(&cost(a))
                })
            })
            .cloned()
            .unwrap_or_default();

        debug!(
            groups = groups.len(),
            winners = winner_indices.len(),
            total = completed.len(),
            "vote concluded"
        );

        let &first = winner_indices.first().ok_or_else(|| {
            GatewayError::Internal("vote produced no winning group".to_string())
        })?;
        let (mut decision, response) = completed[first].clone();
        decision.reason = format!(
            "vote: {}/{} answers agreed ({})",
            winner_indices.len(),
            completed.len(),
            decision.reason
        );
        Ok((decision, response))
    }

    /// N chained calls, each seeing the previous answer, walking a
    /// deterministic provider order.
    async fn run_refine(
        &self,
        request: &ChatRequest,
        policy: &Policy,
        iterations: u32,
    ) -> Result<(Decision, ProviderResponse)> {
        // Sorted registry ids give a stable rotation.
        let providers = self.registry.list();
        if providers.is_empty() {
            return Err(GatewayError::NoEligibleModel(
                "no providers registered".to_string(),
            ));
        }

        let mut working = request.clone();
        let mut last: Option<(Decision, ProviderResponse)> = None;

        for iteration in 0..iterations {
            let preferred = &providers[(iteration as usize) % providers.len()];
            let excluded: HashSet<String> = providers
                .iter()
                .filter(|p| *p != preferred)
                .cloned()
                .collect();

            match self.dispatcher.dispatch(&working, policy, &excluded).await {
                Ok((decision, response)) => {
                    working.messages.push(ChatMessage::assistant(&response.content));
                    working
                        .messages
                        .push(ChatMessage::user("Refine the answer above."));
                    last = Some((decision, response));
                }
                Err(e) => {
                    if is_fatal(&e) {
                        return Err(e);
                    }
                    warn!(iteration, error = %e, "refine iteration failed; continuing");
                }
            }
        }

        last.ok_or_else(|| {
            GatewayError::NoEligibleModel("no refine iteration completed".to_string())
        })
    }
}

fn is_fatal(error: &GatewayError) -> bool {
    matches!(
        error,
        GatewayError::Provider {
            class: crate::llm::ErrorClass::Fatal,
            ..
        }
    )
}

/// Hash of lowercased, whitespace-collapsed content. Answers differing
/// only in spacing or case vote together.
fn content_hash(content: &str) -> String {
    let normalized = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    format!("{:x}", digest)
}
