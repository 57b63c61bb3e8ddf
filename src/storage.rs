//! Storage abstraction for the gateway.
//!
//! The gateway persists provider/model records, three append-only logs
//! (requests, rewards, audit), the routing-config singleton, and the
//! vault's `(salt, blob)` export. The trait keeps the core free of any
//! particular backend; [`InMemoryStore`] is the reference implementation
//! used in development and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Model, ObservationRecord, Policy, ProviderRecord, RouteMode};
use crate::vault::VaultExport;
use crate::Result;

/// Reward-log row feeding exploration-based routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardEntry {
    pub request_id: Uuid,
    pub model_id: String,
    pub token_bucket: String,
    pub success: bool,
    pub reward: f64,
    pub timestamp: DateTime<Utc>,
}

/// Audit row appended on every admin mutation. Never contains secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        entity_kind: impl Into<String>,
        entity_id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
            action: action.into(),
            entity_kind: entity_kind.into(),
            entity_id: entity_id.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Routing-config singleton: policy defaults plus per-key monthly budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub default_mode: RouteMode,
    pub default_max_budget_usd: f64,
    pub default_max_latency_ms: u64,
    pub default_min_weight: f64,
    /// Monthly spend cap applied to keys without an explicit entry.
    /// `None` means unlimited.
    pub default_monthly_budget_usd: Option<f64>,
    pub key_monthly_budgets: HashMap<String, f64>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_mode: RouteMode::Unspecified,
            default_max_budget_usd: 0.0,
            default_max_latency_ms: 0,
            default_min_weight: 0.0,
            default_monthly_budget_usd: None,
            key_monthly_budgets: HashMap::new(),
        }
    }
}

impl RoutingConfig {
    /// The policy a request starts from before hints and directives.
    pub fn default_policy(&self) -> Policy {
        Policy {
            mode: self.default_mode,
            max_budget_usd: self.default_max_budget_usd,
            max_latency_ms: self.default_max_latency_ms,
            min_weight: self.default_min_weight,
        }
    }

    pub fn monthly_limit_for(&self, api_key_id: &str) -> Option<f64> {
        self.key_monthly_budgets
            .get(api_key_id)
            .copied()
            .or(self.default_monthly_budget_usd)
    }
}

/// Persistence contract consumed by the gateway core.
#[async_trait::async_trait]
pub trait GatewayStore: Send + Sync {
    async fn upsert_provider(&self, record: ProviderRecord) -> Result<ProviderRecord>;
    async fn get_provider(&self, id: &str) -> Result<Option<ProviderRecord>>;
    async fn delete_provider(&self, id: &str) -> Result<bool>;
    async fn list_providers(&self) -> Result<Vec<ProviderRecord>>;

    async fn upsert_model(&self, model: Model) -> Result<Model>;
    async fn get_model(&self, id: &str) -> Result<Option<Model>>;
    async fn delete_model(&self, id: &str) -> Result<bool>;
    async fn list_models(&self) -> Result<Vec<Model>>;

    async fn append_request_log(&self, record: ObservationRecord) -> Result<()>;
    /// Total logged cost for an API key since the given instant.
    async fn sum_cost_since(&self, api_key_id: &str, since: DateTime<Utc>) -> Result<f64>;

    async fn append_reward(&self, entry: RewardEntry) -> Result<()>;
    async fn append_audit(&self, entry: AuditEntry) -> Result<()>;
    async fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>>;

    async fn load_routing_config(&self) -> Result<Option<RoutingConfig>>;
    async fn save_routing_config(&self, config: RoutingConfig) -> Result<()>;

    async fn save_vault_blob(&self, export: VaultExport) -> Result<()>;
    async fn load_vault_blob(&self) -> Result<Option<VaultExport>>;
}

/// In-memory store for development and tests. Append-only logs are plain
/// vectors; reads clone, as a database-backed impl would deserialize.
#[derive(Default)]
pub struct InMemoryStore {
    providers: RwLock<HashMap<String, ProviderRecord>>,
    models: RwLock<HashMap<String, Model>>,
    request_log: RwLock<Vec<ObservationRecord>>,
    reward_log: RwLock<Vec<RewardEntry>>,
    audit_log: RwLock<Vec<AuditEntry>>,
    routing_config: RwLock<Option<RoutingConfig>>,
    vault_blob: RwLock<Option<VaultExport>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request-log length, exposed for tests and introspection.
    pub fn request_log_len(&self) -> usize {
        self.request_log.read().unwrap().len()
    }

    pub fn reward_log_len(&self) -> usize {
        self.reward_log.read().unwrap().len()
    }

    pub fn request_log_snapshot(&self) -> Vec<ObservationRecord> {
        self.request_log.read().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl GatewayStore for InMemoryStore {
    async fn upsert_provider(&self, record: ProviderRecord) -> Result<ProviderRecord> {
        let mut providers = self.providers.write().unwrap();
        providers.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_provider(&self, id: &str) -> Result<Option<ProviderRecord>> {
        Ok(self.providers.read().unwrap().get(id).cloned())
    }

    async fn delete_provider(&self, id: &str) -> Result<bool> {
        Ok(self.providers.write().unwrap().remove(id).is_some())
    }

    async fn list_providers(&self) -> Result<Vec<ProviderRecord>> {
        let mut all: Vec<ProviderRecord> =
            self.providers.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn upsert_model(&self, model: Model) -> Result<Model> {
        let mut models = self.models.write().unwrap();
        models.insert(model.id.clone(), model.clone());
        Ok(model)
    }

    async fn get_model(&self, id: &str) -> Result<Option<Model>> {
        Ok(self.models.read().unwrap().get(id).cloned())
    }

    async fn delete_model(&self, id: &str) -> Result<bool> {
        Ok(self.models.write().unwrap().remove(id).is_some())
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let mut all: Vec<Model> = self.models.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn append_request_log(&self, record: ObservationRecord) -> Result<()> {
        self.request_log.write().unwrap().push(record);
        Ok(())
    }

    async fn sum_cost_since(&self, api_key_id: &str, since: DateTime<Utc>) -> Result<f64> {
        let log = self.request_log.read().unwrap();
        Ok(log
            .iter()
            .filter(|r| {
                r.timestamp >= since && r.api_key_id.as_deref() == Some(api_key_id)
            })
            .map(|r| r.cost_usd)
            .sum())
    }

    async fn append_reward(&self, entry: RewardEntry) -> Result<()> {
        self.reward_log.write().unwrap().push(entry);
        Ok(())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        self.audit_log.write().unwrap().push(entry);
        Ok(())
    }

    async fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let log = self.audit_log.read().unwrap();
        Ok(log.iter().rev().take(limit).cloned().collect())
    }

    async fn load_routing_config(&self) -> Result<Option<RoutingConfig>> {
        Ok(self.routing_config.read().unwrap().clone())
    }

    async fn save_routing_config(&self, config: RoutingConfig) -> Result<()> {
        *self.routing_config.write().unwrap() = Some(config);
        Ok(())
    }

    async fn save_vault_blob(&self, export: VaultExport) -> Result<()> {
        *self.vault_blob.write().unwrap() = Some(export);
        Ok(())
    }

    async fn load_vault_blob(&self) -> Result<Option<VaultExport>> {
        Ok(self.vault_blob.read().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{token_bucket, PricingSource, ProviderKind};

    fn observation(api_key: &str, cost: f64, timestamp: DateTime<Utc>) -> ObservationRecord {
        ObservationRecord {
            request_id: Uuid::new_v4(),
            api_key_id: Some(api_key.to_string()),
            model_id: "m".to_string(),
            provider_id: "p".to_string(),
            mode: "normal".to_string(),
            latency_ms: 100,
            cost_usd: cost,
            input_tokens: 10,
            output_tokens: 5,
            success: true,
            error_class: None,
            http_status: Some(200),
            reason: "test".to_string(),
            token_bucket: token_bucket(10).to_string(),
            reward: 0.9,
            timestamp,
        }
    }

    #[tokio::test]
    async fn provider_crud() {
        let store = InMemoryStore::new();
        let record =
            ProviderRecord::new("p1", ProviderKind::OpenAi, "https://api.openai.com").unwrap();
        store.upsert_provider(record).await.unwrap();

        assert!(store.get_provider("p1").await.unwrap().is_some());
        assert_eq!(store.list_providers().await.unwrap().len(), 1);
        assert!(store.delete_provider("p1").await.unwrap());
        assert!(!store.delete_provider("p1").await.unwrap());
    }

    #[tokio::test]
    async fn model_crud() {
        let store = InMemoryStore::new();
        let model = Model {
            id: "m1".to_string(),
            provider_id: "p1".to_string(),
            weight: 5.0,
            max_context_tokens: 8192,
            input_per_1k: 0.01,
            output_per_1k: 0.02,
            enabled: true,
            pricing_source: PricingSource::Manual,
        };
        store.upsert_model(model).await.unwrap();
        assert!(store.get_model("m1").await.unwrap().is_some());
        assert!(store.delete_model("m1").await.unwrap());
    }

    #[tokio::test]
    async fn cost_sum_filters_key_and_window() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let old = now - chrono::Duration::days(60);

        store
            .append_request_log(observation("key-a", 1.0, now))
            .await
            .unwrap();
        store
            .append_request_log(observation("key-a", 2.0, old))
            .await
            .unwrap();
        store
            .append_request_log(observation("key-b", 4.0, now))
            .await
            .unwrap();

        let since = now - chrono::Duration::days(1);
        let sum = store.sum_cost_since("key-a", since).await.unwrap();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn routing_config_round_trip() {
        let store = InMemoryStore::new();
        assert!(store.load_routing_config().await.unwrap().is_none());

        let mut config = RoutingConfig::default();
        config.default_min_weight = 3.0;
        config.key_monthly_budgets.insert("k".to_string(), 50.0);
        store.save_routing_config(config.clone()).await.unwrap();

        let loaded = store.load_routing_config().await.unwrap().unwrap();
        assert_eq!(loaded.default_min_weight, 3.0);
        assert_eq!(loaded.monthly_limit_for("k"), Some(50.0));
        assert_eq!(loaded.monthly_limit_for("other"), None);
    }

    #[test]
    fn default_policy_from_config() {
        let config = RoutingConfig {
            default_mode: RouteMode::Cheap,
            default_min_weight: 2.0,
            ..Default::default()
        };
        let policy = config.default_policy();
        assert_eq!(policy.mode, RouteMode::Cheap);
        assert_eq!(policy.min_weight, 2.0);
    }
}
