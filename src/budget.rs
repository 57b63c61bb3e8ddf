//! Per-key monthly budget enforcement with a short-TTL spend cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, TimeZone, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::{GatewayStore, RoutingConfig};
use crate::Result;

/// Outcome of a budget check.
#[derive(Debug, Clone, Copy)]
pub struct BudgetStatus {
    pub allowed: bool,
    /// `f64::INFINITY` when the key has no limit.
    pub remaining_usd: f64,
    pub spent_usd: f64,
    pub limit_usd: Option<f64>,
}

#[derive(Clone, Copy)]
struct CachedSpend {
    spent_usd: f64,
    computed_at: Instant,
}

/// Caches each key's month-to-date spend for a short TTL. The
/// observability sink invalidates the entry after every log append, so
/// post-request spend is visible to the next check immediately.
pub struct BudgetEnforcer {
    store: Arc<dyn GatewayStore>,
    config: Arc<std::sync::RwLock<RoutingConfig>>,
    cache: DashMap<String, CachedSpend>,
    /// Per-key refresh locks so a cache miss under load refreshes once.
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    ttl: Duration,
}

impl BudgetEnforcer {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        config: Arc<std::sync::RwLock<RoutingConfig>>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            config,
            cache: DashMap::new(),
            refresh_locks: DashMap::new(),
            ttl,
        }
    }

    /// Whether the key may spend, and how much of its monthly limit is
    /// left. Keys without a limit are always allowed.
    pub async fn check(&self, api_key_id: &str) -> Result<BudgetStatus> {
        let limit = {
            let config = self.config.read().unwrap();
            config.monthly_limit_for(api_key_id)
        };
        let Some(limit_usd) = limit else {
            return Ok(BudgetStatus {
                allowed: true,
                remaining_usd: f64::INFINITY,
                spent_usd: 0.0,
                limit_usd: None,
            });
        };

        let spent_usd = self.spend_for(api_key_id).await?;
        let remaining_usd = (limit_usd - spent_usd).max(0.0);
        Ok(BudgetStatus {
            allowed: spent_usd < limit_usd,
            remaining_usd,
            spent_usd,
            limit_usd: Some(limit_usd),
        })
    }

    /// Drop the cached spend so the next check re-reads the log.
    pub fn invalidate(&self, api_key_id: &str) {
        self.cache.remove(api_key_id);
    }

    async fn spend_for(&self, api_key_id: &str) -> Result<f64> {
        if let Some(cached) = self.cache.get(api_key_id) {
            if cached.computed_at.elapsed() < self.ttl {
                return Ok(cached.spent_usd);
            }
        }

        let lock = self
            .refresh_locks
            .entry(api_key_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = self.cache.get(api_key_id) {
            if cached.computed_at.elapsed() < self.ttl {
                return Ok(cached.spent_usd);
            }
        }

        let spent_usd = self
            .store
            .sum_cost_since(api_key_id, month_start())
            .await?;
        debug!(api_key_id, spent_usd, "budget cache refreshed");
        self.cache.insert(
            api_key_id.to_string(),
            CachedSpend {
                spent_usd,
                computed_at: Instant::now(),
            },
        );
        Ok(spent_usd)
    }
}

/// Start of the current calendar month, UTC.
fn month_start() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}
