//! Observability pipeline: per-request fan-out to metrics, durable logs,
//! the event bus, in-memory stats, the time-series store, and the reward
//! ledger — with a bounded queue decoupling durable writes from the
//! request path.

pub mod events;
pub mod metrics;
pub mod reward;
pub mod sink;
pub mod stats;
pub mod tsdb;

pub use events::{EventBus, RouteEvent};
pub use reward::{latency_budget_ms, reward, RewardLedger, COST_NORMALIZATION_USD};
pub use sink::{ObservabilitySink, ObservationParams, SinkWorker};
pub use stats::{Aggregate, StatsRegistry};
pub use tsdb::{InMemoryTimeSeries, MetricPoint, TimeSeriesStore};
