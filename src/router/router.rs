//! Routing decisions: classification → tier search → fallback → warming.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::context::{is_escalating, jumped_from_simple_start, ContextTracker};
use super::warming::WarmingHandle;
use crate::classifier::{Classification, ComplexityClass, QueryClassifier};
use crate::registry::{rank_backends, Backend, BackendId, BackendRegistry, ModelFormat, Tier};
use crate::RouterError;

/// A backend idle longer than this counts as cold: its warm-up cost is
/// added to estimates and it becomes a warming target.
const COLD_AFTER: Duration = Duration::from_secs(300);

/// Hard routing constraints attached to a request.
#[derive(Debug, Clone, Default)]
pub struct RouteConstraints {
    /// Backends that must not be selected.
    pub exclude: Vec<BackendId>,
    /// Reject backends whose benchmarked latency exceeds this.
    pub max_response_time_ms: Option<u64>,
    /// Only consider backends of this format.
    pub format: Option<ModelFormat>,
}

impl RouteConstraints {
    fn is_empty(&self) -> bool {
        self.exclude.is_empty() && self.max_response_time_ms.is_none() && self.format.is_none()
    }

    fn allows(&self, backend: &Backend) -> bool {
        if self.exclude.contains(&backend.id) {
            return false;
        }
        if let Some(cap) = self.max_response_time_ms {
            if backend.avg_response_time_ms() > cap {
                return false;
            }
        }
        if let Some(format) = self.format {
            if backend.format != format {
                return false;
            }
        }
        true
    }
}

/// One request to route.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// The query text.
    pub text: String,
    /// Stable user id for conversation-context tracking, if known.
    pub user_id: Option<String>,
    /// Hard constraints; relaxed only when they empty the candidate set.
    pub constraints: RouteConstraints,
}

impl RouteRequest {
    /// A plain request with no user context or constraints.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: None,
            constraints: RouteConstraints::default(),
        }
    }

    /// Attach a user id for context tracking.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach routing constraints.
    pub fn with_constraints(mut self, constraints: RouteConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// The router's verdict for one request.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// The classifier's verdict the decision was built from.
    pub classification: Classification,
    /// The backend to dispatch to.
    pub backend: Backend,
    /// Second choice for when the primary fails; always differs from the
    /// primary when present.
    pub fallback: Option<Backend>,
    /// Expected latency: benchmarked average scaled by complexity, plus
    /// warm-up cost when the backend is cold.
    pub estimated_response_time_ms: u64,
    /// Human-readable decision trace.
    pub reasoning: String,
    /// Backends queued for predictive warming by this decision.
    pub warming_triggered: Vec<BackendId>,
}

/// Picks a backend for each request and feeds the warming queue.
///
/// Synchronous and lock-light: classification is pure, registry reads are
/// snapshot clones, warming hints are a non-blocking `try_send`.
pub struct ModelRouter {
    registry: Arc<BackendRegistry>,
    classifier: QueryClassifier,
    context: ContextTracker,
    warming: Option<WarmingHandle>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("registry", &self.registry)
            .field("warming", &self.warming.is_some())
            .finish()
    }
}

impl ModelRouter {
    /// Create a router over a registry, with warming disabled.
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            classifier: QueryClassifier::new(),
            context: ContextTracker::new(),
            warming: None,
        }
    }

    /// Enable predictive warming through the given handle.
    pub fn with_warming(mut self, warming: WarmingHandle) -> Self {
        self.warming = Some(warming);
        self
    }

    /// The registry this router selects from.
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Route one request.
    ///
    /// Fails only when the registry holds zero routable backends; every
    /// other condition degrades (constraint relaxation, tier escalation,
    /// cross-tier last resort) rather than erroring.
    pub fn route(&self, request: &RouteRequest) -> Result<RoutingDecision, RouterError> {
        let history = request
            .user_id
            .as_deref()
            .map(|user| self.context.history(user))
            .unwrap_or_default();
        let previews: Vec<&str> = history.iter().map(|t| t.query_preview.as_str()).collect();
        let classification = self.classifier.classify(&request.text, &previews);

        if self.registry.is_empty() {
            return Err(RouterError::NoBackendAvailable);
        }

        let (backend, tier_note) = self.select_primary(&classification, &request.constraints)?;
        let fallback = self.select_fallback(&classification, &backend);
        let estimated_response_time_ms = estimate_latency(
            &backend,
            classification.class,
            self.registry.policies().policy(backend.tier).max_response_time_ms,
        );

        let prior_classes: Vec<ComplexityClass> = history.iter().map(|t| t.class).collect();
        let warming_triggered =
            self.trigger_warming(&classification, &prior_classes, &backend, fallback.as_ref());

        if let Some(user) = request.user_id.as_deref() {
            self.context
                .record(user, &request.text, classification.class, backend.id.clone());
        }

        let reasoning = format!(
            "{} ({:.2}) -> {} via {}; {}",
            classification.class,
            classification.confidence,
            backend.tier,
            backend.id,
            tier_note,
        );
        debug!(
            class = %classification.class,
            backend = %backend.id,
            tier = %backend.tier,
            estimate_ms = estimated_response_time_ms,
            "routing decision"
        );

        Ok(RoutingDecision {
            classification,
            backend,
            fallback,
            estimated_response_time_ms,
            reasoning,
            warming_triggered,
        })
    }

    // ── Selection ────────────────────────────────────────────────────────

    /// Tier search order: suggested, fallback, then the rest of the
    /// escalation chain, then any tier at all. Constraints apply on the
    /// first pass and are dropped when they empty every candidate set.
    fn select_primary(
        &self,
        classification: &Classification,
        constraints: &RouteConstraints,
    ) -> Result<(Backend, String), RouterError> {
        let mut tiers = vec![classification.suggested_tier, classification.fallback_tier];
        for tier in Tier::ASSIGNMENT_ORDER {
            if tier != Tier::Router && !tiers.contains(&tier) {
                tiers.push(tier);
            }
        }

        let passes: &[Option<&RouteConstraints>] = if constraints.is_empty() {
            &[None]
        } else {
            &[Some(constraints), None]
        };

        for pass in passes {
            let relaxed = pass.is_none() && !constraints.is_empty();
            for (tier_index, tier) in tiers.iter().enumerate() {
                let candidates = self.registry.backends_for_tier(*tier);
                let candidates = match pass {
                    Some(constraints) => candidates
                        .into_iter()
                        .filter(|b| constraints.allows(b))
                        .collect(),
                    None => candidates,
                };
                if let Some(best) = pick_best(candidates) {
                    let mut note = match tier_index {
                        0 => "suggested tier".to_string(),
                        1 => "suggested tier empty, escalated to fallback tier".to_string(),
                        _ => format!("tiers exhausted, selected from {tier}"),
                    };
                    if relaxed {
                        note.push_str(" after relaxing constraints");
                    }
                    return Ok((best, note));
                }
            }
        }

        // Nothing available anywhere (or the registry only holds
        // routing-specialist models, which never serve general traffic):
        // take the best-known backend regardless of availability so the
        // dispatcher can still attempt-and-degrade.
        let known: Vec<Backend> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|b| b.tier != Tier::Router)
            .collect();
        match pick_best(known) {
            Some(best) => Ok((
                best,
                "no available backend, selected best-known".to_string(),
            )),
            None => Err(RouterError::NoBackendAvailable),
        }
    }

    /// Fallback backend: best of the class's fallback tier, else the
    /// runner-up in the primary's own tier. Never equals the primary.
    fn select_fallback(
        &self,
        classification: &Classification,
        primary: &Backend,
    ) -> Option<Backend> {
        let from_fallback_tier = self
            .registry
            .backends_for_tier(classification.fallback_tier)
            .into_iter()
            .filter(|b| b.id != primary.id)
            .collect();
        if let Some(backend) = pick_best(from_fallback_tier) {
            return Some(backend);
        }

        let same_tier = self
            .registry
            .backends_for_tier(primary.tier)
            .into_iter()
            .filter(|b| b.id != primary.id)
            .collect();
        pick_best(same_tier)
    }

    // ── Warming ──────────────────────────────────────────────────────────

    fn trigger_warming(
        &self,
        classification: &Classification,
        prior_classes: &[ComplexityClass],
        primary: &Backend,
        fallback: Option<&Backend>,
    ) -> Vec<BackendId> {
        let mut triggered = Vec::new();

        let mut classes = prior_classes.to_vec();
        classes.push(classification.class);
        let jumped = prior_classes
            .first()
            .is_some_and(|first| jumped_from_simple_start(*first, classification.class));

        if is_escalating(&classes) || jumped {
            if let Some(next) = classification.suggested_tier.next_up() {
                if let Some(backend) = self.registry.best_for_tier(next) {
                    self.warm_if_cold(backend, primary, &mut triggered);
                }
            }
        }

        // A conversation with any depth tends to drift toward mid-size
        // models; keep Balanced warm once it has at least two turns.
        if prior_classes.len() >= 2 {
            if let Some(backend) = self.registry.best_for_tier(Tier::Balanced) {
                self.warm_if_cold(backend, primary, &mut triggered);
            }
        }

        if let Some(fallback) = fallback {
            self.warm_if_cold(fallback.clone(), primary, &mut triggered);
        }

        triggered
    }

    fn warm_if_cold(&self, backend: Backend, primary: &Backend, triggered: &mut Vec<BackendId>) {
        if backend.id == primary.id
            || !backend.is_cold(COLD_AFTER)
            || triggered.contains(&backend.id)
        {
            return;
        }
        let Some(warming) = &self.warming else {
            return;
        };
        let id = backend.id.clone();
        if warming.request(backend) {
            triggered.push(id);
        }
    }
}

/// Expected latency for one backend serving one class of request.
///
/// Unbenchmarked backends fall back to their tier's policy bound as the
/// base figure.
fn estimate_latency(backend: &Backend, class: ComplexityClass, tier_bound_ms: u64) -> u64 {
    let base = backend
        .benchmark
        .as_ref()
        .map_or(tier_bound_ms, |b| b.avg_response_time_ms);
    let multiplier = match class {
        ComplexityClass::Simple => 0.75,
        ComplexityClass::Medium => 1.0,
        ComplexityClass::Complex => 1.5,
        ComplexityClass::Expert => 2.0,
    };
    let mut estimate = (base as f64 * multiplier) as u64;
    if backend.is_cold(COLD_AFTER) {
        estimate += backend.benchmark.as_ref().map_or(0, |b| b.warmup_ms);
    }
    estimate
}

/// Best candidate under the crate's shared ranking rule.
fn pick_best(candidates: Vec<Backend>) -> Option<Backend> {
    rank_backends(candidates).into_iter().next()
}
