//! The observability sink — one entry point, seven fan-out targets.
//!
//! `record()` is called exactly once per terminated request (success or
//! failure share the call site) and never blocks: metric increments, the
//! event broadcast, stats, time-series points and the reward ledger are
//! all in-process; the two durable writes (request log, reward log) go
//! through a bounded queue drained by a dedicated worker. When the queue
//! is full the write is dropped and counted — storage pressure must not
//! add to client-visible latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::budget::BudgetEnforcer;
use crate::models::{token_bucket, ObservationRecord};
use crate::storage::{GatewayStore, RewardEntry};

use super::events::{EventBus, RouteEvent};
use super::metrics;
use super::reward::{latency_budget_ms, reward, RewardLedger};
use super::stats::StatsRegistry;
use super::tsdb::{
    MetricPoint, TimeSeriesStore, METRIC_COST_USD, METRIC_INPUT_TOKENS, METRIC_LATENCY_MS,
    METRIC_OUTPUT_TOKENS,
};

/// Everything the caller knows about one terminated request. The sink
/// derives the token bucket and reward scalar itself.
#[derive(Debug, Clone)]
pub struct ObservationParams {
    pub request_id: Uuid,
    pub api_key_id: Option<String>,
    pub model_id: String,
    pub provider_id: String,
    pub mode: String,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub estimated_input_tokens: u32,
    pub success: bool,
    pub error_class: Option<String>,
    pub http_status: Option<u16>,
    pub reason: String,
    /// The policy's latency budget; 0 falls back to the bucket default.
    pub policy_max_latency_ms: u64,
}

struct DurableWrite {
    record: ObservationRecord,
}

/// Fan-out sink. Cheap to share; all methods take `&self`.
pub struct ObservabilitySink {
    tx: mpsc::Sender<DurableWrite>,
    dropped: AtomicU64,
    events: EventBus,
    stats: Arc<StatsRegistry>,
    tsdb: Arc<dyn TimeSeriesStore>,
    rewards: Arc<RewardLedger>,
    budget: Arc<BudgetEnforcer>,
}

/// Owns the queue's receive side. Spawned explicitly so tests can hold
/// the worker back and observe queue-full behavior.
pub struct SinkWorker {
    rx: mpsc::Receiver<DurableWrite>,
    store: Arc<dyn GatewayStore>,
}

impl ObservabilitySink {
    pub fn new(
        queue_capacity: usize,
        store: Arc<dyn GatewayStore>,
        events: EventBus,
        stats: Arc<StatsRegistry>,
        tsdb: Arc<dyn TimeSeriesStore>,
        rewards: Arc<RewardLedger>,
        budget: Arc<BudgetEnforcer>,
    ) -> (Self, SinkWorker) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
                events,
                stats,
                tsdb,
                rewards,
                budget,
            },
            SinkWorker { rx, store },
        )
    }

    /// Record one terminated request. Non-blocking.
    pub fn record(&self, params: ObservationParams) {
        let bucket = token_bucket(params.estimated_input_tokens);
        let budget_ms = latency_budget_ms(params.policy_max_latency_ms, bucket);
        let reward_value = reward(
            params.success,
            params.latency_ms,
            budget_ms,
            params.cost_usd,
        );

        let record = ObservationRecord {
            request_id: params.request_id,
            api_key_id: params.api_key_id.clone(),
            model_id: params.model_id.clone(),
            provider_id: params.provider_id.clone(),
            mode: params.mode.clone(),
            latency_ms: params.latency_ms,
            cost_usd: params.cost_usd,
            input_tokens: params.input_tokens,
            output_tokens: params.output_tokens,
            success: params.success,
            error_class: params.error_class.clone(),
            http_status: params.http_status,
            reason: params.reason.clone(),
            token_bucket: bucket.to_string(),
            reward: reward_value,
            timestamp: Utc::now(),
        };

        // 1. Metric counters and histograms.
        let status = if record.success { "success" } else { "error" };
        metrics::REQUESTS_TOTAL
            .with_label_values(&[&record.mode, &record.model_id, &record.provider_id, status])
            .inc();
        metrics::REQUEST_LATENCY_SECONDS
            .with_label_values(&[&record.model_id, &record.provider_id])
            .observe(record.latency_ms as f64 / 1000.0);
        metrics::REQUEST_COST_USD_TOTAL
            .with_label_values(&[&record.model_id, &record.provider_id])
            .inc_by(record.cost_usd);
        metrics::TOKENS_TOTAL
            .with_label_values(&[&record.model_id, "input"])
            .inc_by(record.input_tokens as u64);
        metrics::TOKENS_TOTAL
            .with_label_values(&[&record.model_id, "output"])
            .inc_by(record.output_tokens as u64);
        if let Some(status) = record.http_status {
            if !record.success {
                metrics::ERRORS_BY_STATUS_TOTAL
                    .with_label_values(&[&status.to_string()])
                    .inc();
            }
        }

        // 4. Event bus.
        self.events.publish(if record.success {
            RouteEvent::Success {
                request_id: record.request_id,
                model_id: record.model_id.clone(),
                provider_id: record.provider_id.clone(),
                mode: record.mode.clone(),
                latency_ms: record.latency_ms,
                cost_usd: record.cost_usd,
                timestamp: record.timestamp,
            }
        } else {
            RouteEvent::Error {
                request_id: record.request_id,
                model_id: record.model_id.clone(),
                provider_id: record.provider_id.clone(),
                mode: record.mode.clone(),
                error_class: record
                    .error_class
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                http_status: record.http_status,
                timestamp: record.timestamp,
            }
        });

        // 5. In-memory stats.
        self.stats.record(&record);

        // 6. Time-series points, success only.
        if record.success {
            let point = |metric, value| MetricPoint {
                timestamp: record.timestamp,
                metric,
                model_id: record.model_id.clone(),
                provider_id: record.provider_id.clone(),
                value,
            };
            self.tsdb
                .append(point(METRIC_LATENCY_MS, record.latency_ms as f64));
            self.tsdb.append(point(METRIC_COST_USD, record.cost_usd));
            self.tsdb
                .append(point(METRIC_INPUT_TOKENS, record.input_tokens as f64));
            self.tsdb
                .append(point(METRIC_OUTPUT_TOKENS, record.output_tokens as f64));
        }

        // Reward ledger for the Thompson sampler.
        self.rewards
            .record(&record.model_id, &record.token_bucket, record.success);

        // 2 & 3. Durable request + reward rows via the bounded queue.
        let api_key_id = record.api_key_id.clone();
        match self.tx.try_send(DurableWrite { record }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::OBSERVATION_DROPS_TOTAL.inc();
                warn!("observation queue full; durable write dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::OBSERVATION_DROPS_TOTAL.inc();
                warn!("observation worker gone; durable write dropped");
            }
        }

        // 7. Budget cache invalidation, after the log enqueue.
        if let Some(key) = api_key_id {
            self.budget.invalidate(&key);
        }
    }

    /// Durable writes dropped so far because the queue was full.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SinkWorker {
    /// Drain the queue until every sink handle is gone.
    pub async fn run(mut self) {
        while let Some(write) = self.rx.recv().await {
            let reward_entry = RewardEntry {
                request_id: write.record.request_id,
                model_id: write.record.model_id.clone(),
                token_bucket: write.record.token_bucket.clone(),
                success: write.record.success,
                reward: write.record.reward,
                timestamp: write.record.timestamp,
            };
            if let Err(e) = self.store.append_request_log(write.record).await {
                warn!(error = %e, "request log append failed; row dropped");
            }
            if let Err(e) = self.store.append_reward(reward_entry).await {
                warn!(error = %e, "reward log append failed; row dropped");
            }
        }
        debug!("observation worker drained and stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
