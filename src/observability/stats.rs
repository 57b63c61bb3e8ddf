//! In-memory running aggregates and a ring buffer of recent observations.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use serde::Serialize;

use crate::models::ObservationRecord;

const RING_CAPACITY: usize = 1024;

/// Running counters for one scope (global, a model, or a provider).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Aggregate {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub total_cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Aggregate {
    fn observe(&mut self, record: &ObservationRecord) {
        self.requests += 1;
        if record.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_latency_ms += record.latency_ms;
        self.total_cost_usd += record.cost_usd;
        self.input_tokens += record.input_tokens as u64;
        self.output_tokens += record.output_tokens as u64;
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

#[derive(Default)]
struct StatsInner {
    global: Aggregate,
    by_model: HashMap<String, Aggregate>,
    by_provider: HashMap<String, Aggregate>,
    recent: VecDeque<ObservationRecord>,
}

/// Thread-safe stats registry. One write lock per observation; reads are
/// admin/introspection traffic.
#[derive(Default)]
pub struct StatsRegistry {
    inner: RwLock<StatsInner>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: &ObservationRecord) {
        let mut inner = self.inner.write().unwrap();
        inner.global.observe(record);
        inner
            .by_model
            .entry(record.model_id.clone())
            .or_default()
            .observe(record);
        inner
            .by_provider
            .entry(record.provider_id.clone())
            .or_default()
            .observe(record);
        if inner.recent.len() == RING_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(record.clone());
    }

    pub fn global(&self) -> Aggregate {
        self.inner.read().unwrap().global.clone()
    }

    pub fn by_model(&self, model_id: &str) -> Option<Aggregate> {
        self.inner.read().unwrap().by_model.get(model_id).cloned()
    }

    pub fn by_provider(&self, provider_id: &str) -> Option<Aggregate> {
        self.inner
            .read()
            .unwrap()
            .by_provider
            .get(provider_id)
            .cloned()
    }

    /// Most recent observations, newest last, at most `n`.
    pub fn recent(&self, n: usize) -> Vec<ObservationRecord> {
        let inner = self.inner.read().unwrap();
        inner
            .recent
            .iter()
            .rev()
            .take(n)
            .rev()
            .cloned()
            .collect()
    }
}
