//! # TokenHub
//!
//! A multi-provider LLM gateway core: a single routing surface in front
//! of heterogeneous model backends (OpenAI-compatible APIs, Anthropic,
//! vLLM). Clients submit a chat or plan request; the gateway selects the
//! best model under a per-request policy, dispatches through a pluggable
//! provider adapter, normalizes the response, and fans observability
//! data out to metrics, durable logs, an event bus, in-memory stats and
//! a time-series store — without letting storage pressure touch request
//! latency.
//!
//! ## Core components
//!
//! - [`Gateway`]: the wired facade exposing `route_and_send`,
//!   `route_and_stream`, `orchestrate` and `select_model`.
//! - [`routing`]: policy resolution (defaults, hints, in-band
//!   `@@tokenhub` directives), eligibility filtering, mode-specific
//!   ranking with a deterministic tie-break canon, failover dispatch,
//!   and multi-iteration orchestration.
//! - [`vault`]: the passphrase-locked credential store. Adapters hold
//!   zero-argument key-lookup closures, so unlocks and rotations take
//!   effect without re-registration.
//! - [`llm`]: the adapter contract ([`llm::traits::Sender`]) and the
//!   provider implementations, each owning its own error classification.
//! - [`observability`]: the per-request fan-out with a bounded
//!   durable-write queue drained by a dedicated worker.
//! - [`admin`]: fleet mutations (providers, models, credentials, routing
//!   config) with validation, reconciliation and an audit trail.
//!
//! The HTTP transport, admin UI, API-key authentication, rate limiting
//! and the durable workflow engine are external collaborators consumed
//! through the interfaces defined here.

pub mod admin;
pub mod budget;
pub mod config;
pub mod gateway;
pub mod health;
pub mod llm;
pub mod models;
pub mod observability;
pub mod routing;
pub mod storage;
pub mod vault;

// Flat API: the common types are importable from the crate root.
pub use admin::{AdminService, ModelPatch};
pub use budget::{BudgetEnforcer, BudgetStatus};
pub use config::{init_tracing, GatewayConfig};
pub use gateway::{Gateway, GatewayBuilder};
pub use health::{HealthProber, ProbeState};
pub use llm::registry::{AdapterInfo, AdapterRegistry};
pub use llm::traits::{ByteStream, KeyFunc, ProbeOutcome, Sender};
pub use llm::{
    AdapterError, ChatMessage, ChatRequest, ClassifiedError, ErrorClass, MessageRole,
    ProviderResponse, TokenUsage,
};
pub use models::{
    Decision, Model, ModelCatalog, ObservationRecord, Policy, PolicyHint, PricingSource,
    ProviderKind, ProviderRecord, RouteMode,
};
pub use observability::{
    EventBus, ObservabilitySink, ObservationParams, RouteEvent, StatsRegistry, TimeSeriesStore,
};
pub use routing::{
    Dispatcher, GatewayByteStream, OrchestrationDirective, OrchestrationMode, Orchestrator,
    PolicyResolver, Selection, Selector,
};
pub use storage::{AuditEntry, GatewayStore, InMemoryStore, RewardEntry, RoutingConfig};
pub use vault::{Vault, VaultError, VaultExport};

use thiserror::Error;

/// Error taxonomy surfaced to callers of the gateway core. Admin
/// handlers map these to HTTP statuses when transporting; the core is
/// transport-neutral.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Validation failed at any stage: policy bounds, empty messages,
    /// unknown mode, malformed directive values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The selector produced an empty eligible set.
    #[error("no eligible model: {0}")]
    NoEligibleModel(String),

    /// The caller's identity could not be established.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Credential-store failure (locked, not enabled, bad passphrase).
    #[error(transparent)]
    Vault(#[from] vault::VaultError),

    /// Classified adapter failure.
    #[error("provider error ({class}): {message}")]
    Provider {
        class: ErrorClass,
        message: String,
        http_status: Option<u16>,
    },

    /// The per-key monthly budget would be crossed.
    #[error("budget exceeded for {api_key_id}: spent {spent_usd:.4} of {limit_usd:.4} USD")]
    BudgetExceeded {
        api_key_id: String,
        spent_usd: f64,
        limit_usd: f64,
    },

    /// Storage outage or backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// A bug or an unexpected condition.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
