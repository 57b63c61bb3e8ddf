//! Dispatch: invoke the selected adapter, classify failures, fail over
//! within policy, and hand every terminated request to the sink once.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use tracing::{debug, warn};

use crate::health::HealthProber;
use crate::llm::registry::AdapterRegistry;
use crate::llm::traits::ByteStream;
use crate::llm::{ChatRequest, ClassifiedError, ErrorClass, ProviderResponse};
use crate::models::{Decision, Model, ModelCatalog, Policy};
use crate::observability::{metrics, ObservabilitySink, ObservationParams};
use crate::routing::selector::Selector;
use crate::{GatewayError, Result};

/// Byte stream yielded by the streaming path, already guarded.
pub type GatewayByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub struct Dispatcher {
    selector: Arc<Selector>,
    registry: Arc<AdapterRegistry>,
    catalog: Arc<ModelCatalog>,
    health: Arc<HealthProber>,
    sink: Arc<ObservabilitySink>,
    /// Total attempts per request, including the first (default 2).
    max_attempts: u32,
    max_stream_bytes: u64,
}

impl Dispatcher {
    pub fn new(
        selector: Arc<Selector>,
        registry: Arc<AdapterRegistry>,
        catalog: Arc<ModelCatalog>,
        health: Arc<HealthProber>,
        sink: Arc<ObservabilitySink>,
        max_attempts: u32,
        max_stream_bytes: u64,
    ) -> Self {
        Self {
            selector,
            registry,
            catalog,
            health,
            sink,
            max_attempts: max_attempts.max(1),
            max_stream_bytes,
        }
    }

    /// Route the request and send it, failing over within policy.
    pub async fn route_and_send(
        &self,
        request: &ChatRequest,
        policy: &Policy,
    ) -> Result<(Decision, ProviderResponse)> {
        self.dispatch(request, policy, &HashSet::new()).await
    }

    /// Like [`route_and_send`](Self::route_and_send) with a provider
    /// exclusion set, used by the orchestrator for rotation.
    pub(crate) async fn dispatch(
        &self,
        request: &ChatRequest,
        policy: &Policy,
        excluded_providers: &HashSet<String>,
    ) -> Result<(Decision, ProviderResponse)> {
        let started = Instant::now();
        let deadline = deadline_of(policy);
        let mut excluded_models: HashSet<String> = HashSet::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let selection = match self.selector.select(
                request,
                policy,
                &excluded_models,
                excluded_providers,
            ) {
                Ok(selection) => selection,
                Err(e) => {
                    self.record_unrouted(request, policy, started, &e);
                    return Err(e);
                }
            };
            let decision = selection.decision;

            let Some(sender) = self.registry.get(&decision.provider_id) else {
                // The adapter vanished between selection and dispatch.
                let e = GatewayError::Internal(format!(
                    "adapter {} disappeared after selection",
                    decision.provider_id
                ));
                self.record_unrouted(request, policy, started, &e);
                return Err(e);
            };

            let remaining = match remaining_deadline(deadline, started) {
                Ok(remaining) => remaining,
                Err(classified) => {
                    self.record_outcome(request, policy, started, &decision, Err(&classified));
                    return Err(provider_error(classified));
                }
            };

            debug!(
                attempt,
                model = %decision.model_id,
                provider = %decision.provider_id,
                "dispatching"
            );

            match sender
                .send(&decision.model_id, request, remaining)
                .await
            {
                Ok(response) => {
                    self.health.observe_success(&decision.provider_id);
                    self.record_outcome(request, policy, started, &decision, Ok(&response));
                    return Ok((decision, response));
                }
                Err(adapter_err) => {
                    let classified = sender.classify_error(&adapter_err);
                    self.health
                        .observe_failure(&decision.provider_id, Some(classified.message.clone()));

                    let deadline_left =
                        remaining_deadline(deadline, started).is_ok();
                    if classified.class.is_recoverable()
                        && attempt < self.max_attempts
                        && deadline_left
                    {
                        warn!(
                            model = %decision.model_id,
                            class = %classified.class,
                            "recoverable provider failure; re-running selection"
                        );
                        excluded_models.insert(decision.model_id.clone());
                        metrics::RETRY_TOTAL.inc();
                        continue;
                    }

                    self.record_outcome(request, policy, started, &decision, Err(&classified));
                    return Err(provider_error(classified));
                }
            }
        }
    }

    /// Route the request and open a guarded pass-through byte stream.
    /// Failover applies to stream setup only; once bytes are flowing the
    /// guard owns termination and the final observation.
    pub async fn route_and_stream(
        &self,
        request: &ChatRequest,
        policy: &Policy,
    ) -> Result<(Decision, GatewayByteStream)> {
        let started = Instant::now();
        let deadline = deadline_of(policy);
        let mut excluded_models: HashSet<String> = HashSet::new();
        let mut attempt = 0u32;
        let no_providers = HashSet::new();

        loop {
            attempt += 1;
            let selection = match self.selector.select(
                request,
                policy,
                &excluded_models,
                &no_providers,
            ) {
                Ok(selection) => selection,
                Err(e) => {
                    self.record_unrouted(request, policy, started, &e);
                    return Err(e);
                }
            };
            let decision = selection.decision;

            let Some(sender) = self.registry.get(&decision.provider_id) else {
                let e = GatewayError::Internal(format!(
                    "adapter {} disappeared after selection",
                    decision.provider_id
                ));
                self.record_unrouted(request, policy, started, &e);
                return Err(e);
            };

            let remaining = match remaining_deadline(deadline, started) {
                Ok(remaining) => remaining,
                Err(classified) => {
                    self.record_outcome(request, policy, started, &decision, Err(&classified));
                    return Err(provider_error(classified));
                }
            };

            match sender.stream(&decision.model_id, request, remaining).await {
                Ok(inner) => {
                    let guard = StreamGuard {
                        inner,
                        sink: Arc::clone(&self.sink),
                        params: self.params_for(request, policy, started, &decision),
                        estimated_cost_usd: decision.estimated_cost_usd,
                        max_bytes: self.max_stream_bytes,
                        seen: 0,
                        started,
                        terminated: false,
                    };
                    return Ok((decision, Box::pin(guard)));
                }
                Err(adapter_err) => {
                    let classified = sender.classify_error(&adapter_err);
                    self.health
                        .observe_failure(&decision.provider_id, Some(classified.message.clone()));

                    if classified.class.is_recoverable()
                        && attempt < self.max_attempts
                        && remaining_deadline(deadline, started).is_ok()
                    {
                        excluded_models.insert(decision.model_id.clone());
                        metrics::RETRY_TOTAL.inc();
                        continue;
                    }

                    self.record_outcome(request, policy, started, &decision, Err(&classified));
                    return Err(provider_error(classified));
                }
            }
        }
    }

    fn params_for(
        &self,
        request: &ChatRequest,
        policy: &Policy,
        started: Instant,
        decision: &Decision,
    ) -> ObservationParams {
        ObservationParams {
            request_id: request.id,
            api_key_id: request.api_key_id.clone(),
            model_id: decision.model_id.clone(),
            provider_id: decision.provider_id.clone(),
            mode: policy.effective_mode().as_str().to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            estimated_input_tokens: request.estimated_input_tokens(),
            success: false,
            error_class: None,
            http_status: None,
            reason: decision.reason.clone(),
            policy_max_latency_ms: policy.max_latency_ms,
        }
    }

    /// One observation per terminated request; success and failure share
    /// this call site.
    fn record_outcome(
        &self,
        request: &ChatRequest,
        policy: &Policy,
        started: Instant,
        decision: &Decision,
        outcome: std::result::Result<&ProviderResponse, &ClassifiedError>,
    ) {
        let mut params = self.params_for(request, policy, started, decision);
        match outcome {
            Ok(response) => {
                params.success = true;
                params.http_status = Some(200);
                params.input_tokens = response.usage.input_tokens;
                params.output_tokens = response.usage.output_tokens;
                params.cost_usd = self.actual_cost(decision, response);
            }
            Err(classified) => {
                params.error_class = Some(classified.class.as_str().to_string());
                params.http_status = classified.http_status;
            }
        }
        self.sink.record(params);
    }

    /// Terminal failure before any model was dispatched (empty eligible
    /// set, vanished adapter).
    fn record_unrouted(
        &self,
        request: &ChatRequest,
        policy: &Policy,
        started: Instant,
        error: &GatewayError,
    ) {
        let error_class = match error {
            GatewayError::NoEligibleModel(_) => "no_eligible_model",
            _ => "internal",
        };
        self.sink.record(ObservationParams {
            request_id: request.id,
            api_key_id: request.api_key_id.clone(),
            model_id: String::new(),
            provider_id: String::new(),
            mode: policy.effective_mode().as_str().to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            estimated_input_tokens: request.estimated_input_tokens(),
            success: false,
            error_class: Some(error_class.to_string()),
            http_status: None,
            reason: String::new(),
            policy_max_latency_ms: policy.max_latency_ms,
        });
    }

    /// Actual cost from reported usage and catalog pricing; falls back to
    /// the estimate when the model left the catalog mid-flight.
    fn actual_cost(&self, decision: &Decision, response: &ProviderResponse) -> f64 {
        match self.catalog.get(&decision.model_id) {
            Some(model) => cost_of(&model, response),
            None => decision.estimated_cost_usd,
        }
    }
}

fn cost_of(model: &Model, response: &ProviderResponse) -> f64 {
    model.estimate_cost(
        response.usage.input_tokens,
        response.usage.output_tokens,
    )
}

fn deadline_of(policy: &Policy) -> Option<Duration> {
    (policy.max_latency_ms > 0).then(|| Duration::from_millis(policy.max_latency_ms))
}

/// Time left in the budget, or a classified timeout when it ran out.
fn remaining_deadline(
    deadline: Option<Duration>,
    started: Instant,
) -> std::result::Result<Option<Duration>, ClassifiedError> {
    let Some(deadline) = deadline else {
        return Ok(None);
    };
    let remaining = deadline.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        Err(ClassifiedError {
            class: ErrorClass::Retryable,
            message: "request latency budget exhausted".to_string(),
            http_status: None,
        })
    } else {
        Ok(Some(remaining))
    }
}

fn provider_error(classified: ClassifiedError) -> GatewayError {
    GatewayError::Provider {
        class: classified.class,
        message: classified.message,
        http_status: classified.http_status,
    }
}

/// Wraps the adapter byte stream, enforcing `max_stream_bytes` and
/// recording exactly one observation at termination — natural end,
/// guard trip, or client drop.
struct StreamGuard {
    inner: ByteStream,
    sink: Arc<ObservabilitySink>,
    params: ObservationParams,
    estimated_cost_usd: f64,
    max_bytes: u64,
    seen: u64,
    started: Instant,
    terminated: bool,
}

impl StreamGuard {
    fn record(&mut self, success: bool, error_class: Option<&str>) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let mut params = self.params.clone();
        params.success = success;
        params.latency_ms = self.started.elapsed().as_millis() as u64;
        params.error_class = error_class.map(str::to_string);
        // Pass-through bytes carry no usage report; cost stays at the
        // selection estimate on success.
        params.cost_usd = if success { self.estimated_cost_usd } else { 0.0 };
        if success {
            params.http_status = Some(200);
        }
        self.sink.record(params);
    }
}

impl Stream for StreamGuard {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.record(true, None);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(bytes))) => {
                this.seen += bytes.len() as u64;
                if this.seen > this.max_bytes {
                    metrics::STREAM_ERRORS_TOTAL.inc();
                    this.record(false, Some("stream_error"));
                    return Poll::Ready(Some(Err(GatewayError::Internal(format!(
                        "stream exceeded max_stream_bytes ({})",
                        this.max_bytes
                    )))));
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                metrics::STREAM_ERRORS_TOTAL.inc();
                this.record(false, Some("stream_error"));
                Poll::Ready(Some(Err(GatewayError::Provider {
                    class: ErrorClass::Retryable,
                    message: e.to_string(),
                    http_status: None,
                })))
            }
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        // Client went away mid-stream; still exactly one observation.
        if !self.terminated {
            self.record(false, Some("stream_aborted"));
        }
    }
}
