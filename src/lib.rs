//! # tokio-model-router
//!
//! Tiered routing for natural-language inference requests over Tokio.
//!
//! ## Architecture
//!
//! Classify → select tier → dispatch, with admission control at the edge:
//! ```text
//! text → QueryClassifier → ModelRouter ── RoutingDecision ──► Dispatcher
//!                             │                                   │
//!                       BackendRegistry                    DispatchBridge
//!                     (tiers, benchmarks)            (worker process, queue,
//!                                                     timeouts, breaker)
//! ```
//!
//! The classifier and router are synchronous and stay off the request's
//! latency-critical path; only the dispatch call suspends, and it suspends
//! on worker I/O rather than a lock.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod bridge;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod registry;
pub mod router;

// Re-exports for convenience
pub use bridge::{BridgeLimits, DispatchBridge, WorkerState};
pub use classifier::{Classification, ComplexityClass, QueryClassifier};
pub use dispatch::{DispatchPayload, DispatchResult, Dispatcher};
pub use registry::{Backend, BackendId, BackendRegistry, Benchmark, Tier};
pub use router::{ModelRouter, RouteConstraints, RouteRequest, RoutingDecision};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if the global subscriber has already been
/// set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Other(format!("tracing init failed: {e}")))
}

/// Errors surfaced by the routing layer.
///
/// Routing degrades quality rather than failing: the only fatal routing
/// condition is a completely empty registry.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The registry holds zero routable backends, so no decision can be
    /// produced.
    ///
    /// Routing-specialist backends ([`Tier::Router`]) never serve general
    /// traffic, so a registry containing only those counts as empty here.
    #[error("no backend available: registry is empty")]
    NoBackendAvailable,

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so misconfiguration surfaces
    /// immediately rather than at the first routed request.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Typed failure modes of a dispatch call.
///
/// Every variant except [`DispatchError::BridgeClosed`] is an expected,
/// recoverable condition: callers implement fallback-then-degrade on these
/// without exception-style control flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Admission control rejected the call: pending + queued work already
    /// sits at the configured cap. Retry later or accept a degraded result.
    #[error("overloaded: pending and queued calls at capacity")]
    Overloaded,

    /// The worker did not answer within the per-call timeout. The call's
    /// concurrency slot has been released; a late response will be dropped.
    #[error("call timed out after {after_ms}ms")]
    Timeout {
        /// The timeout that was enforced, in milliseconds.
        after_ms: u64,
    },

    /// The worker process is not running (starting, crashed, or restarting).
    #[error("worker unavailable")]
    WorkerUnavailable,

    /// The circuit breaker is open; the call failed fast without reaching
    /// the worker.
    #[error("circuit open: worker is failing, call rejected")]
    CircuitOpen,

    /// The bridge event loop has shut down. Only seen during teardown.
    #[error("bridge closed")]
    BridgeClosed,
}
