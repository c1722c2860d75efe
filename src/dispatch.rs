//! # Stage: Dispatch
//!
//! ## Responsibility
//! Execute a [`RoutingDecision`]: call the primary backend's bridge through
//! its circuit breaker, retry once on the fallback, and synthesize a
//! degraded placeholder when both fail.
//!
//! ## Guarantees
//! - `dispatch_or_degrade` always returns a result; callers never see an
//!   exception-style failure for worker trouble
//! - Breakers see every real outcome: successes close them, timeouts and
//!   worker failures open them, backpressure rejections do not
//!
//! ## NOT Responsible For
//! - Choosing the backend (that belongs to `router`)
//! - Worker lifecycle (that belongs to `bridge`)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::{CircuitBreaker, DispatchBridge};
use crate::registry::{Backend, BackendId, BackendRegistry, ModelFormat};
use crate::router::{RoutingDecision, Warmer};
use crate::DispatchError;

/// Fixed text returned when primary and fallback both fail.
const DEGRADED_CONTENT: &str =
    "I'm unable to process that request right now. Please try again in a moment.";

/// What to generate, independent of which backend serves it.
#[derive(Debug, Clone)]
pub struct DispatchPayload {
    /// The prompt text.
    pub prompt: String,
    /// Generation cap; the bridge clamps it to its own limit.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl DispatchPayload {
    /// A payload with default generation settings.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 256,
            temperature: 0.7,
        }
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    /// Generated text, or the degraded placeholder.
    pub content: String,
    /// Generated token count. The worker protocol does not report one, so
    /// this is a whitespace-token estimate of `content`; 0 for degraded
    /// results.
    pub tokens: u32,
    /// Backend that produced the content (the intended primary for
    /// degraded results).
    pub backend_id: BackendId,
    /// Model name the worker reported, if any.
    pub model: Option<String>,
    /// Wall-clock serving time.
    pub duration_ms: u64,
    /// True when this is the placeholder, not a real generation.
    pub degraded: bool,
}

fn estimate_tokens(content: &str) -> u32 {
    content.split_whitespace().count() as u32
}

/// One worker family's dispatch path.
struct Lane {
    bridge: DispatchBridge,
    breaker: CircuitBreaker,
}

/// Executes routing decisions over per-family bridges.
///
/// Each [`ModelFormat`] maps to one lane: a bridge owning that family's
/// worker process, guarded by its own circuit breaker.
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    lanes: HashMap<ModelFormat, Lane>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("lanes", &self.lanes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Dispatcher {
    /// A dispatcher with no lanes; add them with [`Dispatcher::with_lane`].
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            lanes: HashMap::new(),
        }
    }

    /// Attach the dispatch path for one worker family.
    pub fn with_lane(
        mut self,
        format: ModelFormat,
        bridge: DispatchBridge,
        breaker: CircuitBreaker,
    ) -> Self {
        self.lanes.insert(format, Lane { bridge, breaker });
        self
    }

    /// Breaker for one family, for observability and manual trip/reset.
    pub fn breaker(&self, format: ModelFormat) -> Option<&CircuitBreaker> {
        self.lanes.get(&format).map(|lane| &lane.breaker)
    }

    /// Execute a decision: primary, then one fallback retry.
    ///
    /// Returns the fallback's error when both attempts fail.
    pub async fn try_dispatch(
        &self,
        decision: &RoutingDecision,
        payload: &DispatchPayload,
    ) -> Result<DispatchResult, DispatchError> {
        match self.attempt(&decision.backend, payload).await {
            Ok(result) => Ok(result),
            Err(primary_error) => {
                let Some(fallback) = &decision.fallback else {
                    return Err(primary_error);
                };
                info!(
                    primary = %decision.backend.id,
                    fallback = %fallback.id,
                    error = %primary_error,
                    "primary dispatch failed, retrying on fallback"
                );
                self.attempt(fallback, payload).await
            }
        }
    }

    /// Execute a decision and degrade instead of failing.
    ///
    /// Worker trouble yields the fixed placeholder marked `degraded`; the
    /// caller decides how to present it.
    pub async fn dispatch_or_degrade(
        &self,
        decision: &RoutingDecision,
        payload: &DispatchPayload,
    ) -> DispatchResult {
        match self.try_dispatch(decision, payload).await {
            Ok(result) => result,
            Err(e) => {
                warn!(backend = %decision.backend.id, error = %e, "dispatch degraded");
                DispatchResult {
                    content: DEGRADED_CONTENT.to_string(),
                    tokens: 0,
                    backend_id: decision.backend.id.clone(),
                    model: None,
                    duration_ms: 0,
                    degraded: true,
                }
            }
        }
    }

    async fn attempt(
        &self,
        backend: &Backend,
        payload: &DispatchPayload,
    ) -> Result<DispatchResult, DispatchError> {
        let Some(lane) = self.lanes.get(&backend.format) else {
            warn!(backend = %backend.id, format = ?backend.format, "no lane for backend family");
            return Err(DispatchError::WorkerUnavailable);
        };

        if !lane.breaker.check().await {
            return Err(DispatchError::CircuitOpen);
        }

        let started = Instant::now();
        let outcome = lane
            .bridge
            .call(&payload.prompt, payload.max_tokens, payload.temperature)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) if response.success => {
                lane.breaker.record_success().await;
                self.registry.mark_used(&backend.id);
                let content = response.text.unwrap_or_default();
                Ok(DispatchResult {
                    tokens: estimate_tokens(&content),
                    content,
                    backend_id: backend.id.clone(),
                    model: response.model,
                    duration_ms,
                    degraded: false,
                })
            }
            Ok(response) => {
                lane.breaker.record_failure().await;
                debug!(
                    backend = %backend.id,
                    error = response.error.as_deref().unwrap_or("unspecified"),
                    "worker reported generation failure"
                );
                Err(DispatchError::WorkerUnavailable)
            }
            Err(e) => {
                // Backpressure rejections say nothing about worker health;
                // everything else feeds the breaker.
                match &e {
                    DispatchError::Timeout { .. } | DispatchError::WorkerUnavailable => {
                        lane.breaker.record_failure().await;
                    }
                    DispatchError::Overloaded
                    | DispatchError::CircuitOpen
                    | DispatchError::BridgeClosed => {}
                }
                Err(e)
            }
        }
    }
}

/// Warms a backend by pushing a minimal prompt through its lane.
pub struct LaneWarmer {
    dispatcher: Arc<Dispatcher>,
}

impl LaneWarmer {
    /// Wrap a dispatcher for use as the warming loop's [`Warmer`].
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait::async_trait]
impl Warmer for LaneWarmer {
    async fn warm(&self, backend: &Backend) -> Result<(), String> {
        let Some(lane) = self.dispatcher.lanes.get(&backend.format) else {
            return Err(format!("no lane for format {:?}", backend.format));
        };
        lane.bridge
            .call("ping", 1, 0.0)
            .await
            .map_err(|e| e.to_string())?;
        self.dispatcher.registry.mark_used(&backend.id);
        Ok(())
    }
}
