//! The gateway facade: wires the component graph and exposes the
//! routing API consumed by the HTTP transport.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::admin::AdminService;
use crate::budget::BudgetEnforcer;
use crate::config::GatewayConfig;
use crate::health::HealthProber;
use crate::llm::registry::AdapterRegistry;
use crate::llm::{ChatRequest, ProviderResponse};
use crate::models::{Decision, Model, ModelCatalog, PolicyHint};
use crate::observability::{
    EventBus, InMemoryTimeSeries, ObservabilitySink, RewardLedger, StatsRegistry, TimeSeriesStore,
};
use crate::routing::{
    Dispatcher, GatewayByteStream, OrchestrationDirective, Orchestrator, PolicyResolver, Selector,
};
use crate::storage::{GatewayStore, InMemoryStore, RoutingConfig};
use crate::vault::Vault;
use crate::{GatewayError, Result};

/// Assembles a [`Gateway`]. Defaults: in-memory store and time-series,
/// observation worker spawned, probe loop not spawned.
pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn GatewayStore>>,
    tsdb: Option<Arc<dyn TimeSeriesStore>>,
    spawn_probe_loop: bool,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            store: None,
            tsdb: None,
            spawn_probe_loop: false,
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn GatewayStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn time_series(mut self, tsdb: Arc<dyn TimeSeriesStore>) -> Self {
        self.tsdb = Some(tsdb);
        self
    }

    /// Also run the periodic health-probe loop.
    pub fn with_probe_loop(mut self) -> Self {
        self.spawn_probe_loop = true;
        self
    }

    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn GatewayStore>);
        let tsdb = self
            .tsdb
            .unwrap_or_else(|| Arc::new(InMemoryTimeSeries::new()) as Arc<dyn TimeSeriesStore>);

        let routing_config = Arc::new(RwLock::new(
            store.load_routing_config().await?.unwrap_or_default(),
        ));

        let vault = match store.load_vault_blob().await? {
            Some(export) => Arc::new(Vault::from_export(&export)?),
            None => Arc::new(Vault::new()),
        };

        let registry = Arc::new(AdapterRegistry::new(Arc::clone(&vault)));
        let catalog = Arc::new(ModelCatalog::new());
        let health = Arc::new(HealthProber::new());
        let rewards = Arc::new(RewardLedger::new());
        let stats = Arc::new(StatsRegistry::new());
        let events = EventBus::new(config.event_bus_capacity);

        let budget = Arc::new(BudgetEnforcer::new(
            Arc::clone(&store),
            Arc::clone(&routing_config),
            Duration::from_secs(config.budget_cache_ttl_secs),
        ));

        let (sink, worker) = ObservabilitySink::new(
            config.queue_capacity,
            Arc::clone(&store),
            events.clone(),
            Arc::clone(&stats),
            Arc::clone(&tsdb),
            Arc::clone(&rewards),
            Arc::clone(&budget),
        );
        let sink = Arc::new(sink);
        let worker_handle = worker.spawn();

        let selector = Arc::new(Selector::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&rewards),
            config.default_expected_output_tokens,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&selector),
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&health),
            Arc::clone(&sink),
            config.max_attempts,
            config.max_stream_bytes,
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&dispatcher), Arc::clone(&registry));
        let resolver = PolicyResolver::new(Arc::clone(&routing_config));

        let admin = AdminService::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&vault),
            Arc::clone(&health),
            Arc::clone(&routing_config),
        );
        admin.reconcile_from_store().await?;

        let probe_handle = self.spawn_probe_loop.then(|| {
            HealthProber::spawn_probe_loop(
                Arc::clone(&health),
                Arc::clone(&registry),
                Duration::from_secs(config.probe_interval_secs),
            )
        });

        info!(
            providers = registry.list().len(),
            models = catalog.len(),
            "gateway assembled"
        );

        Ok(Gateway {
            store,
            vault,
            registry,
            catalog,
            health,
            stats,
            events,
            budget,
            sink,
            resolver,
            selector,
            dispatcher,
            orchestrator,
            admin,
            worker_handle,
            probe_handle,
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A single HTTP endpoint in front of heterogeneous LLM backends: the
/// owner of the routing engine, observability pipeline, credential
/// vault, and adapter registry.
pub struct Gateway {
    store: Arc<dyn GatewayStore>,
    vault: Arc<Vault>,
    registry: Arc<AdapterRegistry>,
    catalog: Arc<ModelCatalog>,
    health: Arc<HealthProber>,
    stats: Arc<StatsRegistry>,
    events: EventBus,
    budget: Arc<BudgetEnforcer>,
    #[allow(dead_code)]
    sink: Arc<ObservabilitySink>,
    resolver: PolicyResolver,
    selector: Arc<Selector>,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Orchestrator,
    admin: AdminService,
    #[allow(dead_code)]
    worker_handle: JoinHandle<()>,
    probe_handle: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Resolve policy, enforce budget, select, dispatch, observe.
    pub async fn route_and_send(
        &self,
        request: ChatRequest,
        hint: Option<PolicyHint>,
    ) -> Result<(Decision, ProviderResponse)> {
        let (policy, stripped) = self.resolver.resolve(&request, hint.as_ref())?;
        self.enforce_budget(&stripped).await?;
        self.dispatcher.route_and_send(&stripped, &policy).await
    }

    /// Streaming variant: returns the guarded pass-through byte stream.
    pub async fn route_and_stream(
        &self,
        request: ChatRequest,
        hint: Option<PolicyHint>,
    ) -> Result<(Decision, GatewayByteStream)> {
        let (policy, stripped) = self.resolver.resolve(&request, hint.as_ref())?;
        self.enforce_budget(&stripped).await?;
        self.dispatcher.route_and_stream(&stripped, &policy).await
    }

    /// Multi-iteration plan modes.
    pub async fn orchestrate(
        &self,
        request: ChatRequest,
        directive: OrchestrationDirective,
        hint: Option<PolicyHint>,
    ) -> Result<(Decision, ProviderResponse)> {
        let (policy, stripped) = self.resolver.resolve(&request, hint.as_ref())?;
        self.enforce_budget(&stripped).await?;
        self.orchestrator
            .orchestrate(&stripped, &policy, &directive)
            .await
    }

    /// Simulation entry point: run selection without dispatching and
    /// without recording an observation.
    pub async fn select_model(
        &self,
        request: ChatRequest,
        hint: Option<PolicyHint>,
    ) -> Result<(Decision, Vec<Model>)> {
        let (policy, stripped) = self.resolver.resolve(&request, hint.as_ref())?;
        let selection = self.selector.select(
            &stripped,
            &policy,
            &Default::default(),
            &Default::default(),
        )?;
        Ok((selection.decision, selection.eligible))
    }

    async fn enforce_budget(&self, request: &ChatRequest) -> Result<()> {
        let Some(api_key_id) = &request.api_key_id else {
            return Ok(());
        };
        let status = self.budget.check(api_key_id).await?;
        if !status.allowed {
            return Err(GatewayError::BudgetExceeded {
                api_key_id: api_key_id.clone(),
                spent_usd: status.spent_usd,
                limit_usd: status.limit_usd.unwrap_or_default(),
            });
        }
        Ok(())
    }

    pub fn admin(&self) -> &AdminService {
        &self.admin
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub fn health(&self) -> &Arc<HealthProber> {
        &self.health
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        &self.store
    }

    /// Run one health-probe pass now (the loop variant is opt-in at
    /// build time).
    pub async fn run_probe_cycle(&self) {
        self.health.run_probe_cycle(&self.registry).await;
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        // The worker exits on its own once the last sink sender is
        // dropped; the probe loop must be aborted explicitly.
        if let Some(handle) = &self.probe_handle {
            handle.abort();
        }
    }
}
