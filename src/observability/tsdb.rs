//! Time-series points for latency, cost and tokens.
//!
//! The on-disk layout of a real time-series backend is out of scope; the
//! core appends points through a trait and ships an in-memory reference
//! implementation. Appends must be non-blocking by construction — they
//! run on the request path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::RwLock;

pub const METRIC_LATENCY_MS: &str = "latency_ms";
pub const METRIC_COST_USD: &str = "cost_usd";
pub const METRIC_INPUT_TOKENS: &str = "input_tokens";
pub const METRIC_OUTPUT_TOKENS: &str = "output_tokens";

#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub metric: &'static str,
    pub model_id: String,
    pub provider_id: String,
    pub value: f64,
}

pub trait TimeSeriesStore: Send + Sync {
    fn append(&self, point: MetricPoint);
}

/// In-memory reference implementation.
#[derive(Default)]
pub struct InMemoryTimeSeries {
    points: RwLock<Vec<MetricPoint>>,
}

impl InMemoryTimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All points for one metric name, in append order.
    pub fn series(&self, metric: &str) -> Vec<MetricPoint> {
        self.points
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.metric == metric)
            .cloned()
            .collect()
    }
}

impl TimeSeriesStore for InMemoryTimeSeries {
    fn append(&self, point: MetricPoint) {
        self.points.write().unwrap().push(point);
    }
}
