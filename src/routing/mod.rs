//! The routing engine: policy resolution, model selection, dispatch with
//! failover, and multi-iteration orchestration.

pub mod directive;
pub mod dispatcher;
pub mod orchestrator;
pub mod policy;
pub mod selector;

pub use dispatcher::{Dispatcher, GatewayByteStream};
pub use orchestrator::{OrchestrationDirective, OrchestrationMode, Orchestrator, MAX_ITERATIONS};
pub use policy::PolicyResolver;
pub use selector::{Selection, Selector};

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted mock sender shared by routing and gateway tests.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::llm::traits::{ByteStream, Sender};
    use crate::llm::{
        AdapterError, ChatRequest, ClassifiedError, ErrorClass, ProviderResponse, TokenUsage,
    };

    /// Scripted sender: pops one outcome per call, then defaults to
    /// success. Captures every request it sees.
    pub(crate) struct MockSender {
        id: String,
        content: String,
        script: Mutex<VecDeque<Result<(), AdapterError>>>,
        calls: AtomicU32,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl MockSender {
        pub(crate) fn ok(id: &str, content: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                content: content.to_string(),
                script: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn scripted(
            id: &str,
            content: &str,
            script: Vec<Result<(), AdapterError>>,
        ) -> Arc<Self> {
            let sender = Self::ok(id, content);
            *sender.script.lock().unwrap() = script.into();
            sender
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn last_seen(&self) -> Option<ChatRequest> {
            self.seen.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl Sender for MockSender {
        fn id(&self) -> &str {
            &self.id
        }

        async fn send(
            &self,
            model: &str,
            request: &ChatRequest,
            _deadline: Option<Duration>,
        ) -> Result<ProviderResponse, AdapterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            if let Some(outcome) = self.script.lock().unwrap().pop_front() {
                outcome?;
            }
            Ok(ProviderResponse {
                id: format!("resp-{}-{}", self.id, call),
                model: model.to_string(),
                provider_id: self.id.clone(),
                content: self.content.clone(),
                finish_reason: Some("stop".to_string()),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }

        fn classify_error(&self, err: &AdapterError) -> ClassifiedError {
            let class = match err {
                AdapterError::Http { status: 401 | 403, .. } => ErrorClass::Auth,
                AdapterError::Http { status: 429, .. } => ErrorClass::RateLimited,
                AdapterError::Http { status: 400..=499, .. } => ErrorClass::Fatal,
                AdapterError::Http { .. } => ErrorClass::Retryable,
                AdapterError::Network(_) | AdapterError::Timeout | AdapterError::Stream(_) => {
                    ErrorClass::Retryable
                }
                AdapterError::Serialization(_) => ErrorClass::Fatal,
            };
            ClassifiedError {
                class,
                message: err.to_string(),
                http_status: err.http_status(),
            }
        }

        /// Streams the content in 4-byte chunks.
        async fn stream(
            &self,
            _model: &str,
            request: &ChatRequest,
            _deadline: Option<Duration>,
        ) -> Result<ByteStream, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            if let Some(outcome) = self.script.lock().unwrap().pop_front() {
                outcome?;
            }
            let chunks: Vec<Result<Bytes, AdapterError>> = self
                .content
                .as_bytes()
                .chunks(4)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::budget::BudgetEnforcer;
    use crate::health::HealthProber;
    use crate::llm::registry::AdapterRegistry;
    use crate::llm::traits::Sender;
    use crate::llm::{AdapterError, ChatMessage, ChatRequest, ErrorClass};
    use crate::models::{
        Model, ModelCatalog, Policy, PricingSource, ProviderKind, ProviderRecord, RouteMode,
    };
    use crate::observability::{
        metrics, EventBus, InMemoryTimeSeries, ObservabilitySink, RewardLedger, StatsRegistry,
    };
    use crate::storage::{GatewayStore, InMemoryStore, RoutingConfig};
    use crate::vault::Vault;
    use crate::GatewayError;

    use super::dispatcher::Dispatcher;
    use super::orchestrator::{OrchestrationDirective, OrchestrationMode, Orchestrator};
    use super::selector::Selector;
    use super::test_support::MockSender;

    struct Fx {
        catalog: Arc<ModelCatalog>,
        registry: Arc<AdapterRegistry>,
        store: Arc<InMemoryStore>,
        dispatcher: Arc<Dispatcher>,
        orchestrator: Orchestrator,
    }

    fn fx() -> Fx {
        fx_with_stream_limit(1024 * 1024)
    }

    fn fx_with_stream_limit(max_stream_bytes: u64) -> Fx {
        let catalog = Arc::new(ModelCatalog::new());
        let registry = Arc::new(AdapterRegistry::new(Arc::new(Vault::new())));
        let health = Arc::new(HealthProber::new());
        let rewards = Arc::new(RewardLedger::new());
        let store = Arc::new(InMemoryStore::new());
        let budget = Arc::new(BudgetEnforcer::new(
            Arc::clone(&store) as Arc<dyn GatewayStore>,
            Arc::new(std::sync::RwLock::new(RoutingConfig::default())),
            Duration::from_secs(30),
        ));
        let (sink, worker) = ObservabilitySink::new(
            64,
            Arc::clone(&store) as Arc<dyn GatewayStore>,
            EventBus::new(16),
            Arc::new(StatsRegistry::new()),
            Arc::new(InMemoryTimeSeries::new()),
            rewards.clone(),
            budget,
        );
        worker.spawn();

        let selector = Arc::new(Selector::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&health),
            rewards,
            256,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            selector,
            Arc::clone(&registry),
            Arc::clone(&catalog),
            health,
            Arc::new(sink),
            2,
            max_stream_bytes,
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&dispatcher), Arc::clone(&registry));

        Fx {
            catalog,
            registry,
            store,
            dispatcher,
            orchestrator,
        }
    }

    fn install(fx: &Fx, sender: Arc<MockSender>) {
        let id = sender.id().to_string();
        let record =
            ProviderRecord::new(&id, ProviderKind::OpenAi, "https://mock.example.com").unwrap();
        fx.registry.install(record, sender, false);
    }

    fn add_model(fx: &Fx, id: &str, provider: &str, weight: f64, input_per_1k: f64) {
        fx.catalog.upsert(Model {
            id: id.to_string(),
            provider_id: provider.to_string(),
            weight,
            max_context_tokens: 128_000,
            input_per_1k,
            output_per_1k: input_per_1k,
            enabled: true,
            pricing_source: PricingSource::Manual,
        });
    }

    fn request_of_tokens(tokens: usize) -> ChatRequest {
        let mut req = ChatRequest::new(vec![ChatMessage::user("x".repeat(tokens * 4))]);
        req.expected_output_tokens = Some(0);
        req
    }

    fn policy(mode: RouteMode, min_weight: f64) -> Policy {
        Policy {
            mode,
            min_weight,
            ..Default::default()
        }
    }

    async fn wait_for_logs(store: &InMemoryStore, n: usize) {
        for _ in 0..200 {
            if store.request_log_len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("request log never reached {} rows", n);
    }

    // Two models A(weight 5, $0.02/1k) and B(weight 7, $0.05/1k), cheap
    // mode: A wins at ~$0.01 for 500 input tokens.
    #[tokio::test]
    async fn cheap_mode_routes_to_the_cheaper_model() {
        let fx = fx();
        install(&fx, MockSender::ok("p1", "answer"));
        add_model(&fx, "model-a", "p1", 5.0, 0.02);
        add_model(&fx, "model-b", "p1", 7.0, 0.05);

        let (decision, response) = fx
            .dispatcher
            .route_and_send(&request_of_tokens(500), &policy(RouteMode::Cheap, 3.0))
            .await
            .unwrap();
        assert_eq!(decision.model_id, "model-a");
        assert!((decision.estimated_cost_usd - 0.01).abs() < 1e-9);
        assert_eq!(response.content, "answer");
    }

    #[tokio::test]
    async fn high_confidence_routes_to_the_heavier_model() {
        let fx = fx();
        install(&fx, MockSender::ok("p1", "answer"));
        add_model(&fx, "model-a", "p1", 5.0, 0.02);
        add_model(&fx, "model-b", "p1", 7.0, 0.05);

        let (decision, _) = fx
            .dispatcher
            .route_and_send(
                &request_of_tokens(500),
                &policy(RouteMode::HighConfidence, 0.0),
            )
            .await
            .unwrap();
        assert_eq!(decision.model_id, "model-b");
    }

    #[tokio::test]
    async fn min_weight_filters_the_cheap_choice() {
        let fx = fx();
        install(&fx, MockSender::ok("p1", "answer"));
        add_model(&fx, "model-a", "p1", 5.0, 0.02);
        add_model(&fx, "model-b", "p1", 7.0, 0.05);

        let (decision, _) = fx
            .dispatcher
            .route_and_send(&request_of_tokens(500), &policy(RouteMode::Cheap, 6.0))
            .await
            .unwrap();
        assert_eq!(decision.model_id, "model-b");
    }

    // A retryable failure, then success on the second attempt: one
    // response, one success log, one retry_total increment.
    #[tokio::test]
    async fn retryable_failure_is_retried_once_and_logged_once() {
        let fx = fx();
        let sender = MockSender::scripted(
            "p1",
            "recovered",
            vec![Err(AdapterError::Http {
                status: 500,
                body: "upstream blew up".to_string(),
            })],
        );
        install(&fx, Arc::clone(&sender));
        add_model(&fx, "model-a", "p1", 5.0, 0.02);

        let retries_before = metrics::RETRY_TOTAL.get();
        let (_, response) = fx
            .dispatcher
            .route_and_send(&request_of_tokens(100), &policy(RouteMode::Normal, 0.0))
            .await
            .unwrap();

        assert_eq!(response.content, "recovered");
        assert_eq!(sender.calls(), 2);
        // Tests share the global registry, so other suites may also be
        // incrementing; at least our one retry must have landed.
        assert!(metrics::RETRY_TOTAL.get() >= retries_before + 1);

        wait_for_logs(&fx.store, 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let rows = fx.store.request_log_snapshot();
        assert_eq!(rows.len(), 1, "exactly one observation per request");
        assert!(rows[0].success);
    }

    // Auth failures surface immediately: no retry, one error log.
    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let fx = fx();
        let sender = MockSender::scripted(
            "p1",
            "",
            vec![Err(AdapterError::Http {
                status: 401,
                body: "missing bearer token".to_string(),
            })],
        );
        install(&fx, Arc::clone(&sender));
        add_model(&fx, "model-a", "p1", 5.0, 0.02);

        let err = fx
            .dispatcher
            .route_and_send(&request_of_tokens(100), &policy(RouteMode::Normal, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Provider {
                class: ErrorClass::Auth,
                ..
            }
        ));
        assert_eq!(sender.calls(), 1);

        wait_for_logs(&fx.store, 1).await;
        let rows = fx.store.request_log_snapshot();
        assert!(!rows[0].success);
        assert_eq!(rows[0].error_class.as_deref(), Some("auth"));
        assert_eq!(rows[0].http_status, Some(401));
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let fx = fx();
        let sender = MockSender::scripted(
            "p1",
            "",
            vec![Err(AdapterError::Http {
                status: 404,
                body: "no such model".to_string(),
            })],
        );
        install(&fx, Arc::clone(&sender));
        add_model(&fx, "model-a", "p1", 5.0, 0.02);

        let err = fx
            .dispatcher
            .route_and_send(&request_of_tokens(100), &policy(RouteMode::Normal, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Provider {
                class: ErrorClass::Fatal,
                ..
            }
        ));
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limit_fails_over_to_another_model() {
        let fx = fx();
        let flaky = MockSender::scripted(
            "p1",
            "from p1",
            vec![Err(AdapterError::Http {
                status: 429,
                body: "slow down".to_string(),
            })],
        );
        let steady = MockSender::ok("p2", "from p2");
        install(&fx, Arc::clone(&flaky));
        install(&fx, Arc::clone(&steady));
        // p1's model is cheaper, so it is chosen first.
        add_model(&fx, "model-a", "p1", 5.0, 0.01);
        add_model(&fx, "model-b", "p2", 5.0, 0.05);

        let (decision, response) = fx
            .dispatcher
            .route_and_send(&request_of_tokens(100), &policy(RouteMode::Cheap, 0.0))
            .await
            .unwrap();
        assert_eq!(decision.model_id, "model-b");
        assert_eq!(response.content, "from p2");
        assert_eq!(flaky.calls(), 1);
        assert_eq!(steady.calls(), 1);
    }

    #[tokio::test]
    async fn empty_eligible_set_surfaces_and_is_logged() {
        let fx = fx();
        let err = fx
            .dispatcher
            .route_and_send(&request_of_tokens(10), &policy(RouteMode::Normal, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoEligibleModel(_)));

        wait_for_logs(&fx.store, 1).await;
        let rows = fx.store.request_log_snapshot();
        assert_eq!(rows[0].error_class.as_deref(), Some("no_eligible_model"));
    }

    #[tokio::test]
    async fn adversarial_orchestration_rotates_providers() {
        let fx = fx();
        install(&fx, MockSender::ok("p1", "first view"));
        install(&fx, MockSender::ok("p2", "second view"));
        add_model(&fx, "model-a", "p1", 5.0, 0.01);
        add_model(&fx, "model-b", "p2", 5.0, 0.02);

        let (_, response) = fx
            .orchestrator
            .orchestrate(
                &request_of_tokens(50),
                &policy(RouteMode::Normal, 0.0),
                &OrchestrationDirective {
                    mode: OrchestrationMode::Adversarial,
                    iterations: 2,
                },
            )
            .await
            .unwrap();

        assert!(response.content.contains("iteration 1"));
        assert!(response.content.contains("iteration 2"));
        assert!(response.content.contains("first view"));
        assert!(response.content.contains("second view"));
        assert!(response.content.contains("via p1"));
        assert!(response.content.contains("via p2"));
        assert_eq!(response.usage.input_tokens, 20);
    }

    #[tokio::test]
    async fn vote_orchestration_reports_agreement() {
        let fx = fx();
        install(&fx, MockSender::ok("p1", "the answer"));
        add_model(&fx, "model-a", "p1", 5.0, 0.01);

        let (decision, response) = fx
            .orchestrator
            .orchestrate(
                &request_of_tokens(50),
                &policy(RouteMode::Normal, 0.0),
                &OrchestrationDirective {
                    mode: OrchestrationMode::Vote,
                    iterations: 3,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.content, "the answer");
        assert!(decision.reason.starts_with("vote: 3/3"));
    }

    #[tokio::test]
    async fn refine_orchestration_chains_context() {
        let fx = fx();
        let first = MockSender::ok("p1", "draft");
        let second = MockSender::ok("p2", "polished");
        install(&fx, Arc::clone(&first));
        install(&fx, Arc::clone(&second));
        add_model(&fx, "model-a", "p1", 5.0, 0.01);
        add_model(&fx, "model-b", "p2", 5.0, 0.01);

        let (_, response) = fx
            .orchestrator
            .orchestrate(
                &request_of_tokens(50),
                &policy(RouteMode::Normal, 0.0),
                &OrchestrationDirective {
                    mode: OrchestrationMode::Refine,
                    iterations: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.content, "polished");
        // The second iteration saw the first answer as context.
        let seen = second.last_seen().unwrap();
        assert!(seen
            .messages
            .iter()
            .any(|m| m.content == "draft"));
        assert!(seen
            .messages
            .iter()
            .any(|m| m.content == "Refine the answer above."));
    }

    #[tokio::test]
    async fn planning_is_a_single_call() {
        let fx = fx();
        let sender = MockSender::ok("p1", "the plan");
        install(&fx, Arc::clone(&sender));
        add_model(&fx, "model-a", "p1", 8.0, 0.01);

        let (decision, _) = fx
            .orchestrator
            .orchestrate(
                &request_of_tokens(50),
                &policy(RouteMode::Normal, 0.0),
                &OrchestrationDirective {
                    mode: OrchestrationMode::Planning,
                    iterations: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(sender.calls(), 1);
        assert!(decision.reason.starts_with("planning:"));
    }

    #[tokio::test]
    async fn orchestration_bounds_are_validated() {
        let fx = fx();
        install(&fx, MockSender::ok("p1", "x"));
        add_model(&fx, "model-a", "p1", 5.0, 0.01);

        let too_many = fx
            .orchestrator
            .orchestrate(
                &request_of_tokens(10),
                &policy(RouteMode::Normal, 0.0),
                &OrchestrationDirective {
                    mode: OrchestrationMode::Vote,
                    iterations: 11,
                },
            )
            .await;
        assert!(matches!(too_many, Err(GatewayError::InvalidRequest(_))));

        let zero = fx
            .orchestrator
            .orchestrate(
                &request_of_tokens(10),
                &policy(RouteMode::Normal, 0.0),
                &OrchestrationDirective {
                    mode: OrchestrationMode::Refine,
                    iterations: 0,
                },
            )
            .await;
        assert!(matches!(zero, Err(GatewayError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn fatal_iteration_aborts_adversarial_orchestration() {
        let fx = fx();
        let broken = MockSender::scripted(
            "p1",
            "",
            vec![Err(AdapterError::Http {
                status: 404,
                body: "gone".to_string(),
            })],
        );
        install(&fx, Arc::clone(&broken));
        add_model(&fx, "model-a", "p1", 5.0, 0.01);

        let err = fx
            .orchestrator
            .orchestrate(
                &request_of_tokens(10),
                &policy(RouteMode::Normal, 0.0),
                &OrchestrationDirective {
                    mode: OrchestrationMode::Adversarial,
                    iterations: 3,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Provider {
                class: ErrorClass::Fatal,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn streaming_passes_bytes_through_and_logs_once() {
        use futures::StreamExt;

        let fx = fx();
        install(&fx, MockSender::ok("p1", "streamed body bytes"));
        add_model(&fx, "model-a", "p1", 5.0, 0.01);

        let (decision, mut stream) = fx
            .dispatcher
            .route_and_stream(&request_of_tokens(20), &policy(RouteMode::Normal, 0.0))
            .await
            .unwrap();
        assert_eq!(decision.model_id, "model-a");

        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            collected.extend_from_slice(&item.unwrap());
        }
        assert_eq!(collected, b"streamed body bytes");

        wait_for_logs(&fx.store, 1).await;
        let rows = fx.store.request_log_snapshot();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].success);
        assert_eq!(rows[0].error_class, None);
    }

    #[tokio::test]
    async fn stream_guard_terminates_over_limit() {
        use futures::StreamExt;

        let fx = fx_with_stream_limit(8);
        install(&fx, MockSender::ok("p1", "far more bytes than the guard allows"));
        add_model(&fx, "model-a", "p1", 5.0, 0.01);

        let (_, mut stream) = fx
            .dispatcher
            .route_and_stream(&request_of_tokens(20), &policy(RouteMode::Normal, 0.0))
            .await
            .unwrap();

        let mut saw_error = false;
        let mut bytes_through = 0usize;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => bytes_through += chunk.len(),
                Err(e) => {
                    saw_error = true;
                    assert!(e.to_string().contains("max_stream_bytes"));
                }
            }
        }
        assert!(saw_error);
        assert!(bytes_through <= 8);

        wait_for_logs(&fx.store, 1).await;
        let rows = fx.store.request_log_snapshot();
        assert_eq!(rows[0].error_class.as_deref(), Some("stream_error"));
        assert!(!rows[0].success);
    }
}
