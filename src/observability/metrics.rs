//! Prometheus metric statics for the request path.
//!
//! Registration happens once against the default registry; the scrape
//! endpoint lives in the external transport and calls [`gather`].

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, register_counter_vec, register_histogram_vec,
    register_int_counter, register_int_counter_vec, CounterVec, HistogramVec, IntCounter,
    IntCounterVec,
};

lazy_static! {
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tokenhub_requests_total",
        "Routed requests by mode, model, provider and outcome",
        &["mode", "model", "provider", "status"]
    )
    .expect("metric can be registered");

    pub static ref REQUEST_LATENCY_SECONDS: HistogramVec = register_histogram_vec!(
        "tokenhub_request_latency_seconds",
        "End-to-end request latency",
        &["model", "provider"],
        exponential_buckets(0.05, 2.0, 12).expect("valid buckets")
    )
    .expect("metric can be registered");

    pub static ref REQUEST_COST_USD_TOTAL: CounterVec = register_counter_vec!(
        "tokenhub_request_cost_usd_total",
        "Accumulated request cost in USD",
        &["model", "provider"]
    )
    .expect("metric can be registered");

    pub static ref TOKENS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tokenhub_tokens_total",
        "Tokens processed by direction",
        &["model", "direction"]
    )
    .expect("metric can be registered");

    pub static ref ERRORS_BY_STATUS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tokenhub_errors_total",
        "Failed requests by upstream HTTP status",
        &["http_status"]
    )
    .expect("metric can be registered");

    pub static ref RETRY_TOTAL: IntCounter = register_int_counter!(
        "tokenhub_retry_total",
        "Failover retries after recoverable provider errors"
    )
    .expect("metric can be registered");

    pub static ref OBSERVATION_DROPS_TOTAL: IntCounter = register_int_counter!(
        "tokenhub_observation_drops_total",
        "Durable observation writes dropped because the queue was full"
    )
    .expect("metric can be registered");

    pub static ref STREAM_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "tokenhub_stream_errors_total",
        "Streams terminated by the byte guard"
    )
    .expect("metric can be registered");
}

/// Default-registry snapshot for the external scrape endpoint.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    prometheus::gather()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let before = REQUESTS_TOTAL
            .with_label_values(&["cheap", "m", "p", "success"])
            .get();
        REQUESTS_TOTAL
            .with_label_values(&["cheap", "m", "p", "success"])
            .inc();
        let after = REQUESTS_TOTAL
            .with_label_values(&["cheap", "m", "p", "success"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn gather_contains_registered_families() {
        RETRY_TOTAL.inc();
        let names: Vec<String> = gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.iter().any(|n| n == "tokenhub_retry_total"));
    }
}
