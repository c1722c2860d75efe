//! Worker lifecycle: ready handshake gating, crash recovery, restart
//! backoff, and the degraded state after repeated start failures.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_model_router::bridge::protocol::READY_LINE;
use tokio_model_router::bridge::worker::{WorkerIo, WorkerLink, WorkerStartError};
use tokio_model_router::bridge::{BridgeSettings, WorkerRequest, WorkerResponse};
use tokio_model_router::{BridgeLimits, DispatchBridge, DispatchError, WorkerState};

fn echo_io(ready: bool, die_after: Option<usize>) -> WorkerIo {
    let (input_tx, mut input_rx) = mpsc::channel::<String>(64);
    let (output_tx, output_rx) = mpsc::channel::<String>(64);

    tokio::spawn(async move {
        if ready {
            let _ = output_tx.send(READY_LINE.to_string()).await;
        }
        let mut served = 0_usize;
        while let Some(line) = input_rx.recv().await {
            if die_after == Some(served) {
                // Simulates a crash mid-request: exit without answering.
                return;
            }
            served += 1;
            let request: WorkerRequest =
                serde_json::from_str(&line).expect("test: decodable request");
            let response = WorkerResponse {
                request_id: request.id,
                success: true,
                text: Some(format!("served: {}", request.prompt)),
                error: None,
                model: None,
                confidence: None,
            };
            let line = serde_json::to_string(&response).expect("test: encodable");
            let _ = output_tx.send(line).await;
        }
    });

    WorkerIo {
        input: input_tx,
        output: output_rx,
    }
}

fn settings() -> BridgeSettings {
    BridgeSettings {
        limits: BridgeLimits::default(),
        restart_backoff_ms: 50,
        sweep_interval_ms: 10_000,
        degraded_after_failures: 3,
    }
}

#[tokio::test]
async fn test_calls_rejected_until_handshake() {
    struct SilentLink;

    #[async_trait]
    impl WorkerLink for SilentLink {
        async fn start(&self) -> Result<WorkerIo, WorkerStartError> {
            Ok(echo_io(false, None))
        }
    }

    let bridge = DispatchBridge::spawn(Arc::new(SilentLink), settings());
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(bridge.worker_state(), WorkerState::Starting);
    let result = bridge.call("too early", 8, 0.0).await;
    assert_eq!(result, Err(DispatchError::WorkerUnavailable));
}

#[tokio::test]
async fn test_crash_fails_in_flight_then_recovers_after_restart() {
    struct CrashyLink {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl WorkerLink for CrashyLink {
        async fn start(&self) -> Result<WorkerIo, WorkerStartError> {
            let incarnation = self.starts.fetch_add(1, Ordering::SeqCst);
            // First incarnation dies on its first request; replacements are
            // healthy.
            let die_after = if incarnation == 0 { Some(0) } else { None };
            Ok(echo_io(true, die_after))
        }
    }

    let bridge = DispatchBridge::spawn(
        Arc::new(CrashyLink {
            starts: AtomicUsize::new(0),
        }),
        settings(),
    );
    bridge.wait_ready().await.expect("initial ready");

    // The in-flight call is failed, not left hanging.
    let result = bridge.call("fatal request", 8, 0.0).await;
    assert_eq!(result, Err(DispatchError::WorkerUnavailable));
    assert_ne!(bridge.worker_state(), WorkerState::Ready);

    // After the backoff the replacement serves again.
    bridge.wait_ready().await.expect("ready after restart");
    let response = bridge.call("hello again", 8, 0.0).await.expect("served");
    assert_eq!(response.text.as_deref(), Some("served: hello again"));
}

#[tokio::test]
async fn test_repeated_start_failures_reach_degraded_then_recover() {
    struct FlakyStartLink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl WorkerLink for FlakyStartLink {
        async fn start(&self) -> Result<WorkerIo, WorkerStartError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 6 {
                Err(WorkerStartError::Stdio("stdin"))
            } else {
                Ok(echo_io(true, None))
            }
        }
    }

    let bridge = DispatchBridge::spawn(
        Arc::new(FlakyStartLink {
            attempts: AtomicUsize::new(0),
        }),
        settings(),
    );

    // Three failed starts at 50ms backoff put the state at Degraded well
    // before the sixth attempt finally succeeds around the 300ms mark.
    tokio::time::sleep(Duration::from_millis(220)).await;
    assert_eq!(bridge.worker_state(), WorkerState::Degraded);

    // The loop keeps retrying out of degraded and eventually serves.
    bridge.wait_ready().await.expect("recovered");
    let response = bridge.call("finally", 8, 0.0).await.expect("served");
    assert_eq!(response.text.as_deref(), Some("served: finally"));
}

#[tokio::test]
async fn test_queued_calls_fail_with_the_crash_too() {
    struct OneShotCrashLink {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl WorkerLink for OneShotCrashLink {
        async fn start(&self) -> Result<WorkerIo, WorkerStartError> {
            let incarnation = self.starts.fetch_add(1, Ordering::SeqCst);
            let die_after = if incarnation == 0 { Some(0) } else { None };
            Ok(echo_io(true, die_after))
        }
    }

    let bridge = DispatchBridge::spawn(
        Arc::new(OneShotCrashLink {
            starts: AtomicUsize::new(0),
        }),
        BridgeSettings {
            limits: BridgeLimits {
                max_concurrency: 1,
                ..BridgeLimits::default()
            },
            ..settings()
        },
    );
    bridge.wait_ready().await.expect("ready");

    // One in flight (will crash the worker), one queued behind it.
    let in_flight = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.call("crash me", 8, 0.0).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.call("behind the crash", 8, 0.0).await })
    };

    assert_eq!(
        in_flight.await.expect("join"),
        Err(DispatchError::WorkerUnavailable)
    );
    assert_eq!(
        queued.await.expect("join"),
        Err(DispatchError::WorkerUnavailable)
    );
}
