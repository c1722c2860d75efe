//! The backend registry proper: benchmark, assign tiers, answer queries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::benchmark::Benchmarker;
use super::discovery::{fetch_catalog, scan_roots, DiscoveredModel};
use super::{Backend, BackendId, Benchmark, Tier, TierPolicies, UseCase};

/// Quality band within which two backends count as equals, broken by
/// latency instead.
const QUALITY_TIE_BAND: f64 = 0.05;

/// Names that force assignment to [`Tier::Router`] regardless of benchmark.
const ROUTER_NAME_MARKERS: &[&str] = &["router", "routing"];

/// Owns all known backends and their tier assignments.
///
/// Reads take a briefly-held `RwLock` and return cloned snapshots, so
/// request-time queries never wait on discovery or benchmarking. All
/// mutation happens through `refresh`, `mark_used` and `set_available`.
pub struct BackendRegistry {
    backends: RwLock<HashMap<BackendId, Backend>>,
    policies: TierPolicies,
    benchmarker: Arc<dyn Benchmarker>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.len())
            .finish()
    }
}

impl BackendRegistry {
    /// Create an empty registry with the given tier policies and
    /// benchmarking strategy.
    pub fn new(policies: TierPolicies, benchmarker: Arc<dyn Benchmarker>) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            policies,
            benchmarker,
        }
    }

    /// The tier policy table this registry assigns against.
    pub fn policies(&self) -> &TierPolicies {
        &self.policies
    }

    // ── Refresh ──────────────────────────────────────────────────────────

    /// Benchmark a batch of discovered models and rebuild the backend map.
    ///
    /// Backends absent from `models` are dropped; surviving backends keep
    /// their `last_used_at` and availability across the rebuild. A failed
    /// benchmark drops that one model and never aborts the batch.
    pub async fn refresh(&self, models: Vec<DiscoveredModel>) {
        let mut next = HashMap::with_capacity(models.len());

        let measured = futures::future::join_all(models.into_iter().map(|model| async move {
            let outcome = self.benchmarker.benchmark(&model).await;
            (model, outcome)
        }))
        .await;

        for (model, outcome) in measured {
            let benchmark = match outcome {
                Ok(benchmark) => benchmark,
                Err(e) => {
                    warn!(model = %model.id, error = %e, "benchmark failed, dropping model");
                    continue;
                }
            };
            let tier = assign_tier(&self.policies, &model.display_name, &benchmark);
            debug!(model = %model.id, %tier, quality = benchmark.quality_score, "assigned tier");

            next.insert(
                model.id.clone(),
                Backend {
                    id: model.id,
                    display_name: model.display_name,
                    tier,
                    format: model.format,
                    size_bytes: model.size_bytes,
                    is_available: true,
                    benchmark: Some(benchmark),
                    last_used_at: None,
                },
            );
        }

        let mut backends = self.write_lock();
        for (id, backend) in next.iter_mut() {
            if let Some(prev) = backends.get(id) {
                backend.last_used_at = prev.last_used_at;
                backend.is_available = prev.is_available;
            }
        }
        let before = backends.len();
        *backends = next;
        info!(before, after = backends.len(), "registry refreshed");
    }

    /// Insert or replace one backend directly, bypassing benchmarking.
    pub fn insert(&self, backend: Backend) {
        self.write_lock().insert(backend.id.clone(), backend);
    }

    /// Spawn a background task that re-discovers and re-benchmarks on a
    /// fixed interval. The first cycle runs immediately.
    pub fn spawn_background_refresh(
        self: Arc<Self>,
        roots: Vec<PathBuf>,
        catalog_url: Option<String>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut models = scan_roots(&roots);
                if let Some(url) = &catalog_url {
                    match fetch_catalog(&client, url).await {
                        Ok(remote) => models.extend(remote),
                        Err(e) => {
                            warn!(url, error = %e, "catalog fetch failed, using filesystem results only");
                        }
                    }
                }
                self.refresh(models).await;
            }
        })
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Whether the registry holds zero backends.
    pub fn is_empty(&self) -> bool {
        self.read_lock().is_empty()
    }

    /// Number of known backends, available or not.
    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    /// Clone one backend by id.
    pub fn get(&self, id: &BackendId) -> Option<Backend> {
        self.read_lock().get(id).cloned()
    }

    /// Snapshot of every backend, in no particular order.
    pub fn snapshot(&self) -> Vec<Backend> {
        self.read_lock().values().cloned().collect()
    }

    /// All available backends in a tier.
    pub fn backends_for_tier(&self, tier: Tier) -> Vec<Backend> {
        self.read_lock()
            .values()
            .filter(|b| b.tier == tier && b.is_available)
            .cloned()
            .collect()
    }

    /// All available backends whose tier owns the use case.
    pub fn backends_for_use_case(&self, use_case: UseCase) -> Vec<Backend> {
        match self.policies.tier_for_use_case(use_case) {
            Some(tier) => self.backends_for_tier(tier),
            None => Vec::new(),
        }
    }

    /// Best available backend in a tier: highest quality, with latency
    /// breaking ties inside the quality band.
    pub fn best_for_tier(&self, tier: Tier) -> Option<Backend> {
        pick_best(self.backends_for_tier(tier))
    }

    /// Best available backend across the whole registry, tier ignored.
    ///
    /// The last line of defence before reporting an empty registry.
    pub fn best_any(&self) -> Option<Backend> {
        let available = self
            .read_lock()
            .values()
            .filter(|b| b.is_available)
            .cloned()
            .collect();
        pick_best(available)
    }

    // ── Mutation ─────────────────────────────────────────────────────────

    /// Record that a backend just served (or was warmed for) a request.
    pub fn mark_used(&self, id: &BackendId) {
        if let Some(backend) = self.write_lock().get_mut(id) {
            backend.last_used_at = Some(Instant::now());
        }
    }

    /// Flip a backend's availability, e.g. from a health check.
    pub fn set_available(&self, id: &BackendId, available: bool) {
        if let Some(backend) = self.write_lock().get_mut(id) {
            if backend.is_available != available {
                info!(backend = %id, available, "backend availability changed");
            }
            backend.is_available = available;
        }
    }

    // Lock poisoning only happens if a holder panicked; the map is still
    // structurally sound, so recover the guard rather than propagate.
    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<BackendId, Backend>> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<BackendId, Backend>> {
        self.backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Place a benchmarked model in a tier.
///
/// Routing-specialist models (by naming convention) are force-assigned to
/// [`Tier::Router`]. Everything else lands in the first tier whose policy
/// it satisfies, or [`Tier::Balanced`] when nothing matches.
fn assign_tier(policies: &TierPolicies, display_name: &str, benchmark: &Benchmark) -> Tier {
    let lower = display_name.to_lowercase();
    if ROUTER_NAME_MARKERS.iter().any(|m| lower.contains(m)) {
        return Tier::Router;
    }

    for tier in Tier::ASSIGNMENT_ORDER {
        if tier == Tier::Router {
            continue;
        }
        let policy = policies.policy(tier);
        if benchmark.avg_response_time_ms <= policy.max_response_time_ms
            && benchmark.quality_score >= policy.min_quality_score
            && benchmark.memory_mb <= policy.max_memory_mb
        {
            return tier;
        }
    }
    Tier::Balanced
}

/// Order candidates best-first: highest quality wins, and inside the
/// quality tie band lower latency wins.
///
/// The single ranking rule for every selection in the crate; the registry's
/// best-of queries and the router's candidate/fallback searches all go
/// through here.
pub fn rank_backends(mut candidates: Vec<Backend>) -> Vec<Backend> {
    candidates.sort_by(|a, b| {
        let quality_gap = b.quality() - a.quality();
        if quality_gap.abs() <= QUALITY_TIE_BAND {
            a.avg_response_time_ms().cmp(&b.avg_response_time_ms())
        } else if quality_gap > 0.0 {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Less
        }
    });
    candidates
}

fn pick_best(candidates: Vec<Backend>) -> Option<Backend> {
    rank_backends(candidates).into_iter().next()
}
