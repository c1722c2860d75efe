//! End-to-end pipeline: classify → route → dispatch, including fallback,
//! degraded responses, and circuit-breaker fast failure.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_model_router::bridge::protocol::READY_LINE;
use tokio_model_router::bridge::worker::{WorkerIo, WorkerLink, WorkerStartError};
use tokio_model_router::bridge::{
    BreakerConfig, BreakerStatus, BridgeSettings, CircuitBreaker, WorkerRequest, WorkerResponse,
};
use tokio_model_router::registry::{FixedBenchmarker, ModelFormat, TierPolicies};
use tokio_model_router::{
    Backend, BackendId, BackendRegistry, Benchmark, ComplexityClass, DispatchBridge,
    DispatchError, DispatchPayload, Dispatcher, ModelRouter, RouteRequest, RouterError, Tier,
};

/// Worker double tracking how many requests actually reached it.
struct CountingLink {
    succeed: bool,
    served: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerLink for CountingLink {
    async fn start(&self) -> Result<WorkerIo, WorkerStartError> {
        let succeed = self.succeed;
        let served = self.served.clone();
        let (input_tx, mut input_rx) = mpsc::channel::<String>(64);
        let (output_tx, output_rx) = mpsc::channel::<String>(64);

        tokio::spawn(async move {
            let _ = output_tx.send(READY_LINE.to_string()).await;
            while let Some(line) = input_rx.recv().await {
                served.fetch_add(1, Ordering::SeqCst);
                let request: WorkerRequest =
                    serde_json::from_str(&line).expect("test: decodable request");
                let response = if succeed {
                    WorkerResponse {
                        request_id: request.id,
                        success: true,
                        text: Some(format!("reply to: {}", request.prompt)),
                        error: None,
                        model: Some("pipeline-test".into()),
                        confidence: None,
                    }
                } else {
                    WorkerResponse {
                        request_id: request.id,
                        success: false,
                        text: None,
                        error: Some("backend exploded".into()),
                        model: None,
                        confidence: None,
                    }
                };
                let line = serde_json::to_string(&response).expect("test: encodable");
                let _ = output_tx.send(line).await;
            }
        });

        Ok(WorkerIo {
            input: input_tx,
            output: output_rx,
        })
    }
}

fn bench(avg_ms: u64, quality: f64) -> Benchmark {
    Benchmark {
        avg_response_time_ms: avg_ms,
        quality_score: quality,
        memory_mb: 1_024,
        warmup_ms: 500,
        throughput_tok_per_sec: 50.0,
        measured_at: SystemTime::now(),
    }
}

fn backend(id: &str, tier: Tier, format: ModelFormat) -> Backend {
    Backend {
        id: BackendId::new(id),
        display_name: id.to_string(),
        tier,
        format,
        size_bytes: 1,
        is_available: true,
        benchmark: Some(bench(1_000, 0.7)),
        last_used_at: None,
    }
}

fn registry() -> Arc<BackendRegistry> {
    Arc::new(BackendRegistry::new(
        TierPolicies::default(),
        Arc::new(FixedBenchmarker::new(bench(1_000, 0.7))),
    ))
}

async fn lane(succeed: bool) -> (DispatchBridge, Arc<AtomicUsize>) {
    let served = Arc::new(AtomicUsize::new(0));
    let bridge = DispatchBridge::spawn(
        Arc::new(CountingLink {
            succeed,
            served: served.clone(),
        }),
        BridgeSettings {
            restart_backoff_ms: 50,
            ..BridgeSettings::default()
        },
    );
    bridge.wait_ready().await.expect("worker ready");
    (bridge, served)
}

#[tokio::test]
async fn test_greeting_routes_ultra_fast_and_serves() {
    let registry = registry();
    registry.insert(backend("tiny", Tier::UltraFast, ModelFormat::Gguf));
    registry.insert(backend("big", Tier::Powerful, ModelFormat::Gguf));

    let router = ModelRouter::new(registry.clone());
    let (bridge, _) = lane(true).await;
    let dispatcher = Dispatcher::new(registry).with_lane(
        ModelFormat::Gguf,
        bridge,
        CircuitBreaker::new(BreakerConfig::default()),
    );

    let decision = router.route(&RouteRequest::new("Hi")).expect("decision");
    assert_eq!(decision.classification.class, ComplexityClass::Simple);
    assert_eq!(decision.backend.id.as_str(), "tiny");

    let result = dispatcher
        .dispatch_or_degrade(&decision, &DispatchPayload::new("Hi"))
        .await;
    assert!(!result.degraded);
    assert_eq!(result.content, "reply to: Hi");
    assert_eq!(result.tokens, 3);
    assert_eq!(result.backend_id.as_str(), "tiny");
}

#[tokio::test]
async fn test_code_request_routes_powerful() {
    let registry = registry();
    registry.insert(backend("tiny", Tier::UltraFast, ModelFormat::Gguf));
    registry.insert(backend("big", Tier::Powerful, ModelFormat::Gguf));
    let router = ModelRouter::new(registry);

    let decision = router
        .route(&RouteRequest::new(
            "Refactor this function:\n```\nfn parse() {}\n```",
        ))
        .expect("decision");
    assert_eq!(decision.classification.class, ComplexityClass::Expert);
    assert_eq!(decision.backend.id.as_str(), "big");
}

#[tokio::test]
async fn test_empty_registry_reports_no_backend() {
    let router = ModelRouter::new(registry());
    let result = router.route(&RouteRequest::new("anything at all"));
    assert!(matches!(result, Err(RouterError::NoBackendAvailable)));
}

#[tokio::test]
async fn test_failing_primary_served_by_fallback_lane() {
    let registry = registry();
    registry.insert(backend("flaky", Tier::Fast, ModelFormat::Gguf));
    registry.insert(backend("steady", Tier::Balanced, ModelFormat::Safetensors));

    let router = ModelRouter::new(registry.clone());
    let (gguf_bridge, _) = lane(false).await;
    let (st_bridge, _) = lane(true).await;
    let dispatcher = Dispatcher::new(registry)
        .with_lane(
            ModelFormat::Gguf,
            gguf_bridge,
            CircuitBreaker::new(BreakerConfig::default()),
        )
        .with_lane(
            ModelFormat::Safetensors,
            st_bridge,
            CircuitBreaker::new(BreakerConfig::default()),
        );

    let decision = router
        .route(&RouteRequest::new("What's a good lunch spot?"))
        .expect("decision");
    assert_eq!(decision.backend.id.as_str(), "flaky");
    assert_eq!(
        decision.fallback.as_ref().expect("fallback").id.as_str(),
        "steady"
    );

    let result = dispatcher
        .dispatch_or_degrade(&decision, &DispatchPayload::new("lunch?"))
        .await;
    assert!(!result.degraded);
    assert_eq!(result.backend_id.as_str(), "steady");
}

#[tokio::test]
async fn test_total_failure_yields_degraded_placeholder() {
    let registry = registry();
    registry.insert(backend("flaky", Tier::Fast, ModelFormat::Gguf));

    let router = ModelRouter::new(registry.clone());
    let (bridge, _) = lane(false).await;
    let dispatcher = Dispatcher::new(registry).with_lane(
        ModelFormat::Gguf,
        bridge,
        CircuitBreaker::new(BreakerConfig::default()),
    );

    let decision = router
        .route(&RouteRequest::new("What's a good lunch spot?"))
        .expect("decision");
    let result = dispatcher
        .dispatch_or_degrade(&decision, &DispatchPayload::new("lunch?"))
        .await;
    assert!(result.degraded);
    assert!(!result.content.is_empty());
}

#[tokio::test]
async fn test_breaker_opens_and_fails_fast_without_touching_worker() {
    let registry = registry();
    registry.insert(backend("flaky", Tier::Fast, ModelFormat::Gguf));

    let router = ModelRouter::new(registry.clone());
    let (bridge, served) = lane(false).await;
    let breaker = CircuitBreaker::new(BreakerConfig {
        min_calls: 3,
        failure_rate_threshold: 0.5,
        window_size: 10,
        open_duration: std::time::Duration::from_secs(60),
        half_open_max_calls: 1,
    });
    let dispatcher =
        Dispatcher::new(registry).with_lane(ModelFormat::Gguf, bridge, breaker.clone());

    let decision = router
        .route(&RouteRequest::new("What's a good lunch spot?"))
        .expect("decision");

    // Worker-side failures accumulate until the breaker opens.
    for _ in 0..3 {
        let result = dispatcher
            .try_dispatch(&decision, &DispatchPayload::new("lunch?"))
            .await;
        assert_eq!(result, Err(DispatchError::WorkerUnavailable));
    }
    assert_eq!(breaker.status().await, BreakerStatus::Open);
    let served_before = served.load(Ordering::SeqCst);

    // Open circuit: rejected before the worker sees anything.
    let result = dispatcher
        .try_dispatch(&decision, &DispatchPayload::new("lunch?"))
        .await;
    assert_eq!(result, Err(DispatchError::CircuitOpen));
    assert_eq!(served.load(Ordering::SeqCst), served_before);
}
