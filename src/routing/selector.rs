//! Model selection: eligibility filtering, mode-specific ranking, and
//! deterministic tie-breaking.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use rand_distr::{Beta, Distribution};
use tracing::debug;

use crate::health::HealthProber;
use crate::llm::registry::AdapterRegistry;
use crate::llm::ChatRequest;
use crate::models::{token_bucket, Decision, Model, ModelCatalog, Policy, RouteMode};
use crate::observability::RewardLedger;
use crate::{GatewayError, Result};

/// A selection outcome: the winning decision plus the eligible set it was
/// drawn from (exposed for simulation).
#[derive(Debug, Clone)]
pub struct Selection {
    pub decision: Decision,
    pub eligible: Vec<Model>,
}

#[derive(Debug, Clone)]
struct Candidate {
    model: Model,
    estimated_cost_usd: f64,
}

/// Eligibility filter plus mode-specific ranking over the model catalog.
pub struct Selector {
    catalog: Arc<ModelCatalog>,
    registry: Arc<AdapterRegistry>,
    health: Arc<HealthProber>,
    rewards: Arc<RewardLedger>,
    default_expected_output_tokens: u32,
}

impl Selector {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        registry: Arc<AdapterRegistry>,
        health: Arc<HealthProber>,
        rewards: Arc<RewardLedger>,
        default_expected_output_tokens: u32,
    ) -> Self {
        Self {
            catalog,
            registry,
            health,
            rewards,
            default_expected_output_tokens,
        }
    }

    /// Select a model for the request under the policy.
    ///
    /// `excluded_models` and `excluded_providers` shrink the candidate
    /// pool for failover and provider rotation. An exclusion that would
    /// empty the pool is ignored — with a single viable model, retrying
    /// it beats refusing the request.
    pub fn select(
        &self,
        request: &ChatRequest,
        policy: &Policy,
        excluded_models: &HashSet<String>,
        excluded_providers: &HashSet<String>,
    ) -> Result<Selection> {
        let input_tokens = request.estimated_input_tokens();
        let expected_output = request
            .expected_output_tokens
            .unwrap_or(self.default_expected_output_tokens);

        let mut eligible: Vec<Candidate> = Vec::new();
        for model in self.catalog.enabled() {
            if !self.registry.contains(&model.provider_id) {
                continue;
            }
            if model.weight < policy.min_weight {
                continue;
            }
            if input_tokens > model.max_context_tokens {
                continue;
            }
            if self.health.is_down(&model.provider_id) {
                continue;
            }
            let estimated_cost_usd = model.estimate_cost(input_tokens, expected_output);
            if policy.max_budget_usd > 0.0 && estimated_cost_usd > policy.max_budget_usd {
                continue;
            }
            eligible.push(Candidate {
                model,
                estimated_cost_usd,
            });
        }

        if eligible.is_empty() {
            return Err(GatewayError::NoEligibleModel(format!(
                "no model satisfies policy {:?}",
                policy
            )));
        }

        let pool = apply_exclusions(eligible, excluded_models, excluded_providers);
        let eligible_models: Vec<Model> = pool.iter().map(|c| c.model.clone()).collect();

        // A hinted model wins outright when it survived eligibility.
        if let Some(hint) = &request.model_hint {
            if let Some(candidate) = pool.iter().find(|c| &c.model.id == hint) {
                return Ok(Selection {
                    decision: Decision {
                        model_id: candidate.model.id.clone(),
                        provider_id: candidate.model.provider_id.clone(),
                        estimated_cost_usd: candidate.estimated_cost_usd,
                        reason: "model hint".to_string(),
                    },
                    eligible: eligible_models,
                });
            }
        }

        let mode = policy.effective_mode();
        let (winner, reason) = match mode {
            RouteMode::Cheap => self.rank_cheap(&pool),
            RouteMode::Normal => self.rank_normal(&pool),
            RouteMode::HighConfidence | RouteMode::Planning => {
                self.rank_high_confidence(&pool, mode)
            }
            RouteMode::Adversarial => self.rank_adversarial(&pool),
            RouteMode::Thompson => self.rank_thompson(&pool, input_tokens),
            RouteMode::Unspecified => unreachable!("effective_mode never yields Unspecified"),
        };

        debug!(
            model = %winner.model.id,
            provider = %winner.model.provider_id,
            mode = %mode,
            cost = winner.estimated_cost_usd,
            "model selected"
        );

        Ok(Selection {
            decision: Decision {
                model_id: winner.model.id.clone(),
                provider_id: winner.model.provider_id.clone(),
                estimated_cost_usd: winner.estimated_cost_usd,
                reason,
            },
            eligible: eligible_models,
        })
    }

    fn rank_cheap(&self, pool: &[Candidate]) -> (Candidate, String) {
        let winner = pool
            .iter()
            .min_by(|a, b| canon_order(a, b))
            .cloned()
            .expect("pool is non-empty");
        let reason = format!("cheap: lowest estimated cost among {} eligible", pool.len());
        (winner, reason)
    }

    fn rank_normal(&self, pool: &[Candidate]) -> (Candidate, String) {
        let score = |c: &Candidate| c.model.weight / (1.0 + c.estimated_cost_usd);
        let winner = pool
            .iter()
            .min_by(|a, b| {
                score(b)
                    .total_cmp(&score(a))
                    .then_with(|| canon_order(a, b))
            })
            .cloned()
            .expect("pool is non-empty");
        let reason = format!(
            "normal: best weight/cost ratio among {} eligible",
            pool.len()
        );
        (winner, reason)
    }

    fn rank_high_confidence(&self, pool: &[Candidate], mode: RouteMode) -> (Candidate, String) {
        let confident: Vec<&Candidate> =
            pool.iter().filter(|c| c.model.weight >= 7.0).collect();
        if confident.is_empty() {
            // No high-weight model: fall back to the best prior available.
            let winner = pool
                .iter()
                .min_by(|a, b| {
                    b.model
                        .weight
                        .total_cmp(&a.model.weight)
                        .then_with(|| canon_order(a, b))
                })
                .cloned()
                .expect("pool is non-empty");
            let reason = format!("{}: no model with weight >= 7, using top weight", mode);
            return (winner, reason);
        }
        let winner = confident
            .iter()
            .min_by(|a, b| canon_order(a, b))
            .map(|c| (*c).clone())
            .expect("confident set is non-empty");
        let reason = format!(
            "{}: lowest cost among {} models with weight >= 7",
            mode,
            confident.len()
        );
        (winner, reason)
    }

    fn rank_adversarial(&self, pool: &[Candidate]) -> (Candidate, String) {
        // Provider rotation happens via the exclusion set the
        // orchestrator passes per iteration; within the remaining pool
        // the canon order keeps picks deterministic.
        let winner = pool
            .iter()
            .min_by(|a, b| canon_order(a, b))
            .cloned()
            .expect("pool is non-empty");
        let providers: HashSet<&str> =
            pool.iter().map(|c| c.model.provider_id.as_str()).collect();
        let reason = format!(
            "adversarial: provider rotation over {} providers",
            providers.len()
        );
        (winner, reason)
    }

    fn rank_thompson(&self, pool: &[Candidate], input_tokens: u32) -> (Candidate, String) {
        // With no reward history every posterior is Beta(1,1); ranking
        // degenerates to normal until observations arrive.
        if self.rewards.is_empty() {
            let (winner, _) = self.rank_normal(pool);
            return (
                winner,
                "thompson: no reward history, ranked as normal".to_string(),
            );
        }
        let bucket = token_bucket(input_tokens);
        let mut rng = rand::thread_rng();
        let mut best: Option<(f64, &Candidate)> = None;
        for candidate in pool {
            let (alpha, beta) = self.rewards.posterior(&candidate.model.id, bucket);
            let sample = match Beta::new(alpha, beta) {
                Ok(dist) => dist.sample(&mut rng),
                // Degenerate parameters: fall back to a uniform draw.
                Err(_) => rng.gen::<f64>(),
            };
            let better = match &best {
                None => true,
                Some((best_sample, best_candidate)) => {
                    sample > *best_sample
                        || (sample == *best_sample
                            && canon_order(candidate, best_candidate) == Ordering::Less)
                }
            };
            if better {
                best = Some((sample, candidate));
            }
        }
        let (sample, winner) = best.expect("pool is non-empty");
        let reason = format!(
            "thompson: highest posterior sample {:.3} in bucket {}",
            sample, bucket
        );
        (winner.clone(), reason)
    }
}

/// Tie-break canon: lower estimated cost, then higher weight, then
/// lexicographically smaller model id. A total order, so golden tests are
/// stable across insertion-order changes.
fn canon_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.estimated_cost_usd
        .total_cmp(&b.estimated_cost_usd)
        .then_with(|| b.model.weight.total_cmp(&a.model.weight))
        .then_with(|| a.model.id.cmp(&b.model.id))
}

/// Shrink the pool by the exclusion sets, unless doing so would empty it.
fn apply_exclusions(
    pool: Vec<Candidate>,
    excluded_models: &HashSet<String>,
    excluded_providers: &HashSet<String>,
) -> Vec<Candidate> {
    if excluded_models.is_empty() && excluded_providers.is_empty() {
        return pool;
    }
    let shrunk: Vec<Candidate> = pool
        .iter()
        .filter(|c| {
            !excluded_models.contains(&c.model.id)
                && !excluded_providers.contains(&c.model.provider_id)
        })
        .cloned()
        .collect();
    if shrunk.is_empty() {
        pool
    } else {
        shrunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CredStore, PricingSource, ProviderKind, ProviderRecord};
    use crate::vault::Vault;

    fn fixture() -> (Arc<ModelCatalog>, Arc<AdapterRegistry>, Arc<HealthProber>, Arc<RewardLedger>)
    {
        let catalog = Arc::new(ModelCatalog::new());
        let registry = Arc::new(AdapterRegistry::new(Arc::new(Vault::new())));
        let health = Arc::new(HealthProber::new());
        let rewards = Arc::new(RewardLedger::new());
        (catalog, registry, health, rewards)
    }

    fn register(registry: &AdapterRegistry, id: &str) {
        let mut record =
            ProviderRecord::new(id, ProviderKind::OpenAi, "https://api.example.com").unwrap();
        record.cred_store = CredStore::None;
        registry.register(&record, None).unwrap();
    }

    fn model(id: &str, provider: &str, weight: f64, input_per_1k: f64) -> Model {
        Model {
            id: id.to_string(),
            provider_id: provider.to_string(),
            weight,
            max_context_tokens: 128_000,
            input_per_1k,
            output_per_1k: input_per_1k * 2.0,
            enabled: true,
            pricing_source: PricingSource::Manual,
        }
    }

    fn request_of_tokens(tokens: usize) -> ChatRequest {
        let mut req = ChatRequest::new(vec![crate::llm::ChatMessage::user("x".repeat(tokens * 4))]);
        req.expected_output_tokens = Some(0);
        req
    }

    fn selector(
        catalog: Arc<ModelCatalog>,
        registry: Arc<AdapterRegistry>,
        health: Arc<HealthProber>,
        rewards: Arc<RewardLedger>,
    ) -> Selector {
        Selector::new(catalog, registry, health, rewards, 256)
    }

    fn policy(mode: RouteMode, min_weight: f64) -> Policy {
        Policy {
            mode,
            min_weight,
            ..Default::default()
        }
    }

    fn none() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn cheap_picks_lowest_cost() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("a", "p1", 5.0, 0.02));
        catalog.upsert(model("b", "p1", 7.0, 0.05));

        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(
                &request_of_tokens(500),
                &policy(RouteMode::Cheap, 3.0),
                &none(),
                &none(),
            )
            .unwrap();
        assert_eq!(selection.decision.model_id, "a");
        assert!((selection.decision.estimated_cost_usd - 0.01).abs() < 1e-9);
        assert!(selection.decision.reason.starts_with("cheap:"));
        assert_eq!(selection.eligible.len(), 2);
    }

    #[test]
    fn high_confidence_requires_weight_seven() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("a", "p1", 5.0, 0.02));
        catalog.upsert(model("b", "p1", 7.0, 0.05));

        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(
                &request_of_tokens(500),
                &policy(RouteMode::HighConfidence, 0.0),
                &none(),
                &none(),
            )
            .unwrap();
        assert_eq!(selection.decision.model_id, "b");
    }

    #[test]
    fn high_confidence_falls_back_to_top_weight() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("a", "p1", 5.0, 0.02));
        catalog.upsert(model("b", "p1", 6.0, 0.05));

        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(
                &request_of_tokens(100),
                &policy(RouteMode::HighConfidence, 0.0),
                &none(),
                &none(),
            )
            .unwrap();
        assert_eq!(selection.decision.model_id, "b");
        assert!(selection.decision.reason.contains("top weight"));
    }

    #[test]
    fn min_weight_filters_candidates() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("a", "p1", 5.0, 0.02));
        catalog.upsert(model("b", "p1", 7.0, 0.05));

        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(
                &request_of_tokens(500),
                &policy(RouteMode::Cheap, 6.0),
                &none(),
                &none(),
            )
            .unwrap();
        assert_eq!(selection.decision.model_id, "b");
        assert_eq!(selection.eligible.len(), 1);
    }

    #[test]
    fn unregistered_or_down_providers_are_ineligible() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("a", "p1", 5.0, 0.02));
        catalog.upsert(model("orphan", "ghost", 9.0, 0.001));

        health.track("p1");

        let s = selector(
            Arc::clone(&catalog),
            registry,
            Arc::clone(&health),
            rewards,
        );
        let selection = s
            .select(
                &request_of_tokens(10),
                &policy(RouteMode::Normal, 0.0),
                &none(),
                &none(),
            )
            .unwrap();
        assert_eq!(selection.decision.model_id, "a");

        for _ in 0..4 {
            health.observe_failure("p1", None);
        }
        assert!(matches!(
            s.select(
                &request_of_tokens(10),
                &policy(RouteMode::Normal, 0.0),
                &none(),
                &none(),
            ),
            Err(GatewayError::NoEligibleModel(_))
        ));
    }

    #[test]
    fn context_window_filters() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        let mut small = model("small-ctx", "p1", 8.0, 0.001);
        small.max_context_tokens = 100;
        catalog.upsert(small);
        catalog.upsert(model("big-ctx", "p1", 4.0, 0.01));

        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(
                &request_of_tokens(500),
                &policy(RouteMode::Normal, 0.0),
                &none(),
                &none(),
            )
            .unwrap();
        assert_eq!(selection.decision.model_id, "big-ctx");
    }

    #[test]
    fn budget_filters_when_set() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("pricey", "p1", 9.0, 1.0));
        catalog.upsert(model("frugal", "p1", 4.0, 0.001));

        let mut p = policy(RouteMode::Normal, 0.0);
        p.max_budget_usd = 0.01;

        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(&request_of_tokens(500), &p, &none(), &none())
            .unwrap();
        assert_eq!(selection.decision.model_id, "frugal");
        assert_eq!(selection.eligible.len(), 1);
    }

    #[test]
    fn model_hint_short_circuits() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("a", "p1", 5.0, 0.001));
        catalog.upsert(model("b", "p1", 7.0, 0.05));

        let mut req = request_of_tokens(100);
        req.model_hint = Some("b".to_string());

        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(&req, &policy(RouteMode::Cheap, 0.0), &none(), &none())
            .unwrap();
        assert_eq!(selection.decision.model_id, "b");
        assert_eq!(selection.decision.reason, "model hint");
    }

    #[test]
    fn ineligible_hint_falls_through_to_ranking() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("a", "p1", 5.0, 0.001));

        let mut req = request_of_tokens(100);
        req.model_hint = Some("disabled-model".to_string());

        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(&req, &policy(RouteMode::Cheap, 0.0), &none(), &none())
            .unwrap();
        assert_eq!(selection.decision.model_id, "a");
    }

    #[test]
    fn tie_break_is_deterministic() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        // Identical cost and weight: the lexicographically smaller id wins.
        catalog.upsert(model("zeta", "p1", 5.0, 0.02));
        catalog.upsert(model("alpha", "p1", 5.0, 0.02));

        let s = selector(catalog, registry, health, rewards);
        for _ in 0..10 {
            let selection = s
                .select(
                    &request_of_tokens(100),
                    &policy(RouteMode::Cheap, 0.0),
                    &none(),
                    &none(),
                )
                .unwrap();
            assert_eq!(selection.decision.model_id, "alpha");
        }
    }

    #[test]
    fn exclusion_is_ignored_when_it_would_empty_the_pool() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("only", "p1", 5.0, 0.02));

        let excluded: HashSet<String> = ["only".to_string()].into();
        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(
                &request_of_tokens(100),
                &policy(RouteMode::Normal, 0.0),
                &excluded,
                &none(),
            )
            .unwrap();
        assert_eq!(selection.decision.model_id, "only");
    }

    #[test]
    fn provider_exclusion_rotates() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        register(&registry, "p2");
        catalog.upsert(model("a", "p1", 5.0, 0.01));
        catalog.upsert(model("b", "p2", 5.0, 0.02));

        let excluded: HashSet<String> = ["p1".to_string()].into();
        let s = selector(catalog, registry, health, rewards);
        let selection = s
            .select(
                &request_of_tokens(100),
                &policy(RouteMode::Adversarial, 0.0),
                &none(),
                &excluded,
            )
            .unwrap();
        assert_eq!(selection.decision.provider_id, "p2");
    }

    #[test]
    fn thompson_prefers_the_proven_model() {
        let (catalog, registry, health, rewards) = fixture();
        register(&registry, "p1");
        catalog.upsert(model("good", "p1", 5.0, 0.01));
        catalog.upsert(model("bad", "p1", 5.0, 0.01));

        for _ in 0..200 {
            rewards.record("good", "small", true);
            rewards.record("bad", "small", false);
        }

        let s = selector(catalog, registry, health, rewards);
        let mut good_wins = 0;
        for _ in 0..50 {
            let selection = s
                .select(
                    &request_of_tokens(10),
                    &policy(RouteMode::Thompson, 0.0),
                    &none(),
                    &none(),
                )
                .unwrap();
            if selection.decision.model_id == "good" {
                good_wins += 1;
            }
        }
        // Beta(201,1) vs Beta(1,201): the proven model should dominate.
        assert!(good_wins >= 45, "good won only {}/50", good_wins);
    }
}
