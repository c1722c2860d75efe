//! # Stage: Backend Registry
//!
//! ## Responsibility
//! Discover candidate inference backends, attach benchmark data, assign each
//! backend to a performance tier, and answer "best backend for tier /
//! use-case" queries from the router.
//!
//! ## Guarantees
//! - Request-time reads never block on discovery or benchmarking — callers
//!   get cloned snapshots from a briefly-held lock
//! - Every backend belongs to exactly one tier
//! - A registry with zero backends answers `None`, never panics
//!
//! ## NOT Responsible For
//! - Picking a backend for a concrete request (that belongs to `router`)
//! - Talking to worker processes (that belongs to `bridge`)

pub mod benchmark;
pub mod discovery;

mod store;

pub use benchmark::{Benchmarker, EstimatingBenchmarker, FixedBenchmarker};
pub use discovery::{fetch_catalog, scan_roots, CatalogEntry, DiscoveredModel};
pub use store::{rank_backends, BackendRegistry};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime};

// ── Tiers ────────────────────────────────────────────────────────────────

/// A named latency/quality bucket that backends are assigned to.
///
/// The first four tiers form a total escalation order
/// `UltraFast < Fast < Balanced < Powerful`; [`Tier::Router`] hosts
/// routing-specialist models and sits outside the escalation chain.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Sub-second small models: greetings, quick replies, classification.
    UltraFast,
    /// Low-latency general chat.
    Fast,
    /// Mid-size models balancing latency and quality.
    Balanced,
    /// Slow, high-capability models for code and deep analysis.
    Powerful,
    /// Routing-specialist models; never a fallback destination.
    Router,
}

impl Tier {
    /// Tier-assignment priority order: a benchmarked backend is placed in
    /// the first tier whose policy it satisfies.
    pub const ASSIGNMENT_ORDER: [Tier; 5] = [
        Tier::UltraFast,
        Tier::Fast,
        Tier::Balanced,
        Tier::Powerful,
        Tier::Router,
    ];

    /// The next tier up the escalation chain, if any.
    ///
    /// `Powerful` and `Router` have no higher tier.
    pub fn next_up(self) -> Option<Tier> {
        match self {
            Tier::UltraFast => Some(Tier::Fast),
            Tier::Fast => Some(Tier::Balanced),
            Tier::Balanced => Some(Tier::Powerful),
            Tier::Powerful | Tier::Router => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::UltraFast => "ultra_fast",
            Tier::Fast => "fast",
            Tier::Balanced => "balanced",
            Tier::Powerful => "powerful",
            Tier::Router => "router",
        };
        write!(f, "{name}")
    }
}

/// Workload categories used to map requests to an owning tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    /// Greetings and single-fact replies.
    QuickReplies,
    /// Lightweight text classification.
    Classification,
    /// General conversation.
    GeneralChat,
    /// Code generation and debugging.
    CodeGeneration,
    /// Multi-step reasoning and long-form analysis.
    DeepAnalysis,
    /// Meta-routing decisions made by a specialist model.
    Routing,
}

// ── Tier policies ────────────────────────────────────────────────────────

/// Static admission rules for one tier.
///
/// Policies are configuration: loaded once, immutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TierPolicy {
    /// Upper bound on a backend's benchmarked average response time (ms).
    pub max_response_time_ms: u64,
    /// Minimum benchmarked quality score (`0.0..=1.0`).
    pub min_quality_score: f64,
    /// Upper bound on a backend's benchmarked resident memory (MB).
    pub max_memory_mb: u64,
    /// Use cases this tier owns.
    pub allowed_use_cases: Vec<UseCase>,
    /// Tier to fall back to when this one has no available backend.
    pub fallback_tier: Option<Tier>,
}

/// The full tier policy table.
///
/// One policy per tier; defaults reflect the escalation chain
/// `UltraFast → Fast → Balanced → Powerful` with `Powerful` falling back
/// *down* to `Balanced`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TierPolicies {
    /// Policy for [`Tier::UltraFast`].
    #[serde(default = "default_ultra_fast_policy")]
    pub ultra_fast: TierPolicy,
    /// Policy for [`Tier::Fast`].
    #[serde(default = "default_fast_policy")]
    pub fast: TierPolicy,
    /// Policy for [`Tier::Balanced`].
    #[serde(default = "default_balanced_policy")]
    pub balanced: TierPolicy,
    /// Policy for [`Tier::Powerful`].
    #[serde(default = "default_powerful_policy")]
    pub powerful: TierPolicy,
    /// Policy for [`Tier::Router`].
    #[serde(default = "default_router_policy")]
    pub router: TierPolicy,
}

/// Default policy for the ultra-fast tier.
fn default_ultra_fast_policy() -> TierPolicy {
    TierPolicy {
        max_response_time_ms: 500,
        min_quality_score: 0.5,
        max_memory_mb: 2_048,
        allowed_use_cases: vec![UseCase::QuickReplies, UseCase::Classification],
        fallback_tier: Some(Tier::Fast),
    }
}

/// Default policy for the fast tier.
fn default_fast_policy() -> TierPolicy {
    TierPolicy {
        max_response_time_ms: 1_500,
        min_quality_score: 0.6,
        max_memory_mb: 4_096,
        allowed_use_cases: vec![UseCase::GeneralChat],
        fallback_tier: Some(Tier::Balanced),
    }
}

/// Default policy for the balanced tier.
fn default_balanced_policy() -> TierPolicy {
    TierPolicy {
        max_response_time_ms: 4_000,
        min_quality_score: 0.75,
        max_memory_mb: 8_192,
        allowed_use_cases: vec![UseCase::GeneralChat, UseCase::DeepAnalysis],
        fallback_tier: Some(Tier::Powerful),
    }
}

/// Default policy for the powerful tier.
fn default_powerful_policy() -> TierPolicy {
    TierPolicy {
        max_response_time_ms: 12_000,
        min_quality_score: 0.85,
        max_memory_mb: 16_384,
        allowed_use_cases: vec![UseCase::CodeGeneration, UseCase::DeepAnalysis],
        fallback_tier: Some(Tier::Balanced),
    }
}

/// Default policy for the router tier.
fn default_router_policy() -> TierPolicy {
    TierPolicy {
        max_response_time_ms: 800,
        min_quality_score: 0.4,
        max_memory_mb: 1_024,
        allowed_use_cases: vec![UseCase::Routing],
        fallback_tier: None,
    }
}

impl Default for TierPolicies {
    fn default() -> Self {
        Self {
            ultra_fast: default_ultra_fast_policy(),
            fast: default_fast_policy(),
            balanced: default_balanced_policy(),
            powerful: default_powerful_policy(),
            router: default_router_policy(),
        }
    }
}

impl TierPolicies {
    /// Look up the policy for a tier.
    pub fn policy(&self, tier: Tier) -> &TierPolicy {
        match tier {
            Tier::UltraFast => &self.ultra_fast,
            Tier::Fast => &self.fast,
            Tier::Balanced => &self.balanced,
            Tier::Powerful => &self.powerful,
            Tier::Router => &self.router,
        }
    }

    /// Find the tier whose policy owns a use case.
    ///
    /// Tiers are tested in assignment order, so a use case listed under two
    /// tiers resolves to the faster one.
    pub fn tier_for_use_case(&self, use_case: UseCase) -> Option<Tier> {
        Tier::ASSIGNMENT_ORDER
            .into_iter()
            .find(|tier| self.policy(*tier).allowed_use_cases.contains(&use_case))
    }
}

// ── Backends ─────────────────────────────────────────────────────────────

/// On-disk serialization format of a discovered model.
///
/// Each format is served by its own worker-process family.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// llama.cpp GGUF weights.
    Gguf,
    /// Hugging Face safetensors weights.
    Safetensors,
    /// Apple MLX weights.
    Mlx,
    /// Raw PyTorch `.bin` weights.
    Bin,
    /// Format could not be determined from the file name.
    Unknown,
}

impl ModelFormat {
    /// Infer a format from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> ModelFormat {
        match ext.to_ascii_lowercase().as_str() {
            "gguf" => ModelFormat::Gguf,
            "safetensors" => ModelFormat::Safetensors,
            "mlx" => ModelFormat::Mlx,
            "bin" => ModelFormat::Bin,
            _ => ModelFormat::Unknown,
        }
    }
}

/// Unique backend identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendId(
    /// The raw string ID, typically derived from the model file name.
    pub String,
);

impl BackendId {
    /// Create a new [`BackendId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One benchmark measurement attached to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Benchmark {
    /// Average response time over the benchmark workload (ms).
    pub avg_response_time_ms: u64,
    /// Output quality score in `0.0..=1.0`.
    pub quality_score: f64,
    /// Resident memory while serving (MB).
    pub memory_mb: u64,
    /// Cold-start warm-up cost (ms).
    pub warmup_ms: u64,
    /// Sustained generation throughput (tokens/second).
    pub throughput_tok_per_sec: f64,
    /// When this measurement was taken. Stale benchmarks remain usable;
    /// freshness comes from re-measuring on the discovery poll.
    pub measured_at: SystemTime,
}

/// A concrete inference-serving unit assigned to exactly one tier.
///
/// Backends are owned by the [`BackendRegistry`]; the router only ever sees
/// cloned snapshots and never mutates registry state.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Unique identifier.
    pub id: BackendId,
    /// Human-readable name, also used for the routing-specialist naming
    /// convention check.
    pub display_name: String,
    /// The tier this backend is assigned to.
    pub tier: Tier,
    /// Serialization format, which selects the worker-process family.
    pub format: ModelFormat,
    /// Model size on disk in bytes.
    pub size_bytes: u64,
    /// Health-check driven availability flag.
    pub is_available: bool,
    /// Latest benchmark, if one has been taken.
    pub benchmark: Option<Benchmark>,
    /// When this backend last served (or was warmed for) a request.
    pub last_used_at: Option<Instant>,
}

impl Backend {
    /// Benchmarked quality score, or `0.0` when unbenchmarked.
    pub fn quality(&self) -> f64 {
        self.benchmark.as_ref().map_or(0.0, |b| b.quality_score)
    }

    /// Benchmarked average response time, or `u64::MAX` when unbenchmarked
    /// so unmeasured backends rank last on latency ties.
    pub fn avg_response_time_ms(&self) -> u64 {
        self.benchmark
            .as_ref()
            .map_or(u64::MAX, |b| b.avg_response_time_ms)
    }

    /// Whether the backend has gone cold: never used, or idle longer than
    /// `idle_limit`.
    pub fn is_cold(&self, idle_limit: std::time::Duration) -> bool {
        match self.last_used_at {
            None => true,
            Some(at) => at.elapsed() > idle_limit,
        }
    }
}
