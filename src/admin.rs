//! Admin operations: fleet mutations with validation, persistence,
//! registry/catalog reconciliation, and an audit trail.
//!
//! Every mutation follows the same shape: validate → persist → propagate
//! to the live subsystems (adapter registry, model catalog, health
//! prober) → append an audit row. Credential values never reach the
//! audit log.

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use url::Host;

use crate::health::HealthProber;
use crate::llm::registry::{credential_key, AdapterRegistry};
use crate::models::{
    base_url_host, normalize_base_url, Model, ModelCatalog, PricingSource, ProviderKind,
    ProviderRecord,
};
use crate::storage::{AuditEntry, GatewayStore, RoutingConfig};
use crate::vault::Vault;
use crate::{GatewayError, Result};

/// Partial model update; present fields replace the stored values.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ModelPatch {
    pub weight: Option<f64>,
    pub max_context_tokens: Option<u32>,
    pub input_per_1k: Option<f64>,
    pub output_per_1k: Option<f64>,
    pub enabled: Option<bool>,
    pub pricing_source: Option<PricingSource>,
}

pub struct AdminService {
    store: Arc<dyn GatewayStore>,
    registry: Arc<AdapterRegistry>,
    catalog: Arc<ModelCatalog>,
    vault: Arc<Vault>,
    health: Arc<HealthProber>,
    routing_config: Arc<RwLock<RoutingConfig>>,
}

impl AdminService {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        registry: Arc<AdapterRegistry>,
        catalog: Arc<ModelCatalog>,
        vault: Arc<Vault>,
        health: Arc<HealthProber>,
        routing_config: Arc<RwLock<RoutingConfig>>,
    ) -> Self {
        Self {
            store,
            registry,
            catalog,
            vault,
            health,
            routing_config,
        }
    }

    /// Create or replace a provider. The base URL is normalized and its
    /// hostname must resolve (IP literals bypass the check).
    pub async fn upsert_provider(
        &self,
        actor: &str,
        mut record: ProviderRecord,
        key_override: Option<String>,
    ) -> Result<ProviderRecord> {
        if record.id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "provider id is empty".to_string(),
            ));
        }
        record.base_url = normalize_base_url(&record.base_url)?;
        self.check_host_resolves(&record.base_url).await?;
        record.updated_at = chrono::Utc::now();

        let stored = self.store.upsert_provider(record.clone()).await?;
        if stored.enabled {
            self.registry.register(&stored, key_override)?;
            self.health.track(&stored.id);
        } else {
            self.registry.unregister(&stored.id);
        }

        self.audit(actor, "provider.upsert", "provider", &stored.id, &format!(
            "kind={} base_url={} enabled={}",
            stored.kind, stored.base_url, stored.enabled
        ))
        .await;
        Ok(stored)
    }

    pub async fn delete_provider(&self, actor: &str, id: &str) -> Result<bool> {
        let existed = self.store.delete_provider(id).await?;
        self.registry.unregister(id);
        self.health.mark_removed(id);
        if existed {
            self.audit(actor, "provider.delete", "provider", id, "").await;
        }
        Ok(existed)
    }

    pub async fn upsert_model(&self, actor: &str, model: Model) -> Result<Model> {
        model.validate()?;
        let stored = self.store.upsert_model(model).await?;
        self.catalog.upsert(stored.clone());
        self.audit(actor, "model.upsert", "model", &stored.id, &format!(
            "provider={} weight={} enabled={}",
            stored.provider_id, stored.weight, stored.enabled
        ))
        .await;
        Ok(stored)
    }

    pub async fn patch_model(&self, actor: &str, id: &str, patch: ModelPatch) -> Result<Model> {
        let Some(mut model) = self.store.get_model(id).await? else {
            return Err(GatewayError::InvalidRequest(format!(
                "model {} does not exist",
                id
            )));
        };
        if let Some(weight) = patch.weight {
            model.weight = weight;
        }
        if let Some(ctx) = patch.max_context_tokens {
            model.max_context_tokens = ctx;
        }
        if let Some(input) = patch.input_per_1k {
            model.input_per_1k = input;
        }
        if let Some(output) = patch.output_per_1k {
            model.output_per_1k = output;
        }
        if let Some(enabled) = patch.enabled {
            model.enabled = enabled;
        }
        if let Some(source) = patch.pricing_source {
            model.pricing_source = source;
        }
        model.validate()?;

        let stored = self.store.upsert_model(model).await?;
        self.catalog.upsert(stored.clone());
        self.audit(actor, "model.patch", "model", id, "").await;
        Ok(stored)
    }

    pub async fn delete_model(&self, actor: &str, id: &str) -> Result<bool> {
        let existed = self.store.delete_model(id).await?;
        self.catalog.remove(id);
        if existed {
            self.audit(actor, "model.delete", "model", id, "").await;
        }
        Ok(existed)
    }

    /// Store a provider credential in the vault. Adapters bound to the
    /// vault pick it up on their next request — no re-registration.
    pub async fn put_credential(
        &self,
        actor: &str,
        provider_id: &str,
        secret: &str,
    ) -> Result<()> {
        let export = self.vault.set(&credential_key(provider_id), secret)?;
        self.store.save_vault_blob(export).await?;
        self.audit(actor, "credential.set", "provider", provider_id, "")
            .await;
        Ok(())
    }

    pub async fn delete_credential(&self, actor: &str, provider_id: &str) -> Result<()> {
        let export = self.vault.remove(&credential_key(provider_id))?;
        self.store.save_vault_blob(export).await?;
        self.audit(actor, "credential.delete", "provider", provider_id, "")
            .await;
        Ok(())
    }

    /// First-time vault provisioning.
    pub async fn init_vault(&self, actor: &str, passphrase: &str) -> Result<()> {
        let export = self.vault.initialize(passphrase)?;
        self.store.save_vault_blob(export).await?;
        self.audit(actor, "vault.init", "vault", "vault", "").await;
        Ok(())
    }

    pub async fn unlock_vault(&self, actor: &str, passphrase: &str) -> Result<()> {
        self.vault.unlock(passphrase)?;
        self.audit(actor, "vault.unlock", "vault", "vault", "").await;
        Ok(())
    }

    pub async fn lock_vault(&self, actor: &str) -> Result<()> {
        self.vault.lock();
        self.audit(actor, "vault.lock", "vault", "vault", "").await;
        Ok(())
    }

    pub async fn rotate_vault_password(&self, actor: &str, old: &str, new: &str) -> Result<()> {
        let export = self.vault.rotate_password(old, new)?;
        self.store.save_vault_blob(export).await?;
        self.audit(actor, "vault.rotate", "vault", "vault", "").await;
        Ok(())
    }

    pub async fn update_routing_config(&self, actor: &str, config: RoutingConfig) -> Result<()> {
        config.default_policy().validate()?;
        if config
            .key_monthly_budgets
            .values()
            .chain(config.default_monthly_budget_usd.iter())
            .any(|b| *b < 0.0)
        {
            return Err(GatewayError::InvalidRequest(
                "monthly budgets must be non-negative".to_string(),
            ));
        }

        self.store.save_routing_config(config.clone()).await?;
        *self.routing_config.write().unwrap() = config;
        self.audit(actor, "routing_config.update", "routing_config", "singleton", "")
            .await;
        Ok(())
    }

    /// Rebuild the live registry and catalog from persisted records.
    /// Called at startup. Records with unparseable content are logged
    /// and skipped rather than failing the boot.
    pub async fn reconcile_from_store(&self) -> Result<()> {
        let providers = self.store.list_providers().await?;
        for record in &providers {
            if !record.enabled {
                continue;
            }
            match self.registry.register(record, None) {
                Ok(()) => self.health.track(&record.id),
                Err(e) => {
                    warn!(provider_id = %record.id, error = %e, "skipping provider at startup")
                }
            }
        }

        for model in self.store.list_models().await? {
            match model.validate() {
                Ok(()) => self.catalog.upsert(model),
                Err(e) => warn!(error = %e, "skipping model at startup"),
            }
        }
        info!(
            providers = providers.len(),
            models = self.catalog.len(),
            "reconciled from store"
        );
        Ok(())
    }

    async fn check_host_resolves(&self, base_url: &str) -> Result<()> {
        let (host, port) = base_url_host(base_url)?;
        match host {
            // IP literals bypass the resolution check.
            Host::Ipv4(_) | Host::Ipv6(_) => Ok(()),
            Host::Domain(domain) => {
                tokio::net::lookup_host((domain.as_str(), port))
                    .await
                    .map_err(|e| {
                        GatewayError::InvalidRequest(format!(
                            "base_url host {:?} does not resolve: {}",
                            domain, e
                        ))
                    })?;
                Ok(())
            }
        }
    }

    async fn audit(&self, actor: &str, action: &str, entity_kind: &str, entity_id: &str, detail: &str) {
        let entry = AuditEntry::new(actor, action, entity_kind, entity_id, detail);
        if let Err(e) = self.store.append_audit(entry).await {
            // Audit failures never fail the mutation they describe.
            warn!(error = %e, action, "audit append failed");
        }
    }
}

/// Parse a persisted provider-kind string, used by storage decoders.
/// Unknown kinds are reported so callers can log and skip.
pub fn parse_provider_kind(kind: &str) -> Result<ProviderKind> {
    ProviderKind::from_str(kind)
}
