//! Adapter registry — the keyed set of live provider senders.
//!
//! Provider records become live [`Sender`]s here. Credential lookup is
//! deferred behind a [`KeyFunc`] closure resolved at registration time
//! (explicit override, then vault closure, then empty), so vault unlocks
//! and rotations take effect without re-registration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::models::{normalize_base_url, CredStore, ProviderKind, ProviderRecord};
use crate::vault::Vault;
use crate::Result;

use super::providers::{anthropic, openai, vllm};
use super::traits::{KeyFunc, Sender};

/// Vault entry name holding a provider's API key.
pub fn credential_key(provider_id: &str) -> String {
    format!("provider:{}:api_key", provider_id)
}

/// Non-secret description of a registered adapter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdapterInfo {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub has_credentials: bool,
}

struct Entry {
    record: ProviderRecord,
    sender: Arc<dyn Sender>,
    has_credentials: bool,
}

/// Keyed set of senders. Read-heavy (every request resolves its adapter
/// here); writers are admin mutations. At most one entry per id;
/// re-registration replaces atomically.
pub struct AdapterRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    vault: Arc<Vault>,
}

impl AdapterRegistry {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            vault,
        }
    }

    /// Construct the variant-specific sender for a provider record and
    /// install it, replacing any existing entry for the same id.
    pub fn register(&self, record: &ProviderRecord, key_override: Option<String>) -> Result<()> {
        let base_url = normalize_base_url(&record.base_url)?;

        let has_override = key_override.is_some();
        let key_fn: KeyFunc = match key_override {
            Some(key) => Arc::new(move || key.clone()),
            None if record.cred_store == CredStore::Vault => {
                let vault = Arc::clone(&self.vault);
                let entry = credential_key(&record.id);
                // Re-read on every call; yields empty while locked.
                Arc::new(move || vault.get(&entry).ok().flatten().unwrap_or_default())
            }
            None => Arc::new(String::new),
        };
        let has_credentials = has_override || record.cred_store == CredStore::Vault;

        let sender: Arc<dyn Sender> = match record.kind {
            ProviderKind::OpenAi => Arc::new(openai::OpenAiAdapter::new(
                record.id.clone(),
                openai::OpenAiConfig::with_base_url(base_url.clone()),
                key_fn,
            )),
            ProviderKind::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(
                record.id.clone(),
                anthropic::AnthropicConfig::with_base_url(base_url.clone()),
                key_fn,
            )),
            ProviderKind::Vllm => Arc::new(vllm::VllmAdapter::new(
                record.id.clone(),
                vllm::VllmConfig::with_base_url(base_url.clone()),
                key_fn,
            )),
        };

        let mut normalized = record.clone();
        normalized.base_url = base_url;

        let mut entries = self.entries.write().unwrap();
        let replaced = entries
            .insert(
                record.id.clone(),
                Entry {
                    record: normalized,
                    sender,
                    has_credentials,
                },
            )
            .is_some();
        info!(
            provider_id = %record.id,
            kind = %record.kind,
            replaced,
            "adapter registered"
        );
        Ok(())
    }

    /// Install a pre-built sender under a record. This is the ad-hoc
    /// path — models may bind to adapters that were never persisted as
    /// provider records. `register` is the record-driven path.
    pub fn install(
        &self,
        record: ProviderRecord,
        sender: Arc<dyn Sender>,
        has_credentials: bool,
    ) {
        let mut entries = self.entries.write().unwrap();
        info!(provider_id = %record.id, "adapter installed");
        entries.insert(
            record.id.clone(),
            Entry {
                record,
                sender,
                has_credentials,
            },
        );
    }

    /// Remove an entry. Returns whether it existed. Dependent subsystems
    /// (health prober) are notified by the admin layer that drove the
    /// removal.
    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.entries.write().unwrap();
        let removed = entries.remove(id).is_some();
        if removed {
            info!(provider_id = %id, "adapter unregistered");
        } else {
            debug!(provider_id = %id, "unregister of unknown adapter ignored");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Sender>> {
        let entries = self.entries.read().unwrap();
        entries.get(id).map(|e| Arc::clone(&e.sender))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().unwrap().contains_key(id)
    }

    /// Registered adapter ids, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn list_info(&self) -> Vec<AdapterInfo> {
        let entries = self.entries.read().unwrap();
        let mut infos: Vec<AdapterInfo> = entries
            .values()
            .map(|e| AdapterInfo {
                id: e.record.id.clone(),
                kind: e.record.kind,
                base_url: e.record.base_url.clone(),
                has_credentials: e.has_credentials,
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Rebuild entries from persisted provider records. Disabled records
    /// are skipped; records whose type string no longer parses were
    /// filtered by the storage layer, which logs and skips them.
    pub fn reconcile(&self, records: &[ProviderRecord]) {
        for record in records {
            if !record.enabled {
                continue;
            }
            if let Err(e) = self.register(record, None) {
                warn!(provider_id = %record.id, error = %e, "skipping provider during reconcile");
            }
        }
    }
}
