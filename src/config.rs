//! Runtime configuration.
//!
//! One [`RouterSettings`] tree covers the whole pipeline: tier policies,
//! discovery sources, bridge limits, breaker tuning, warming. Loaded from
//! TOML with serde defaults for every field, validated up front so
//! misconfiguration surfaces at startup instead of mid-request.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::bridge::{BreakerConfig, BridgeSettings};
use crate::registry::TierPolicies;
use crate::RouterError;

/// Environment variable naming the config file path.
pub const CONFIG_PATH_ENV: &str = "MODEL_ROUTER_CONFIG";

/// Backend discovery sources and cadence.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DiscoverySettings {
    /// Directories scanned recursively for model files.
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
    /// Optional HTTP catalog endpoint returning a JSON model list.
    #[serde(default)]
    pub catalog_url: Option<String>,
    /// Seconds between discovery/benchmark cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("models")]
}

fn default_poll_interval_secs() -> u64 {
    300
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            catalog_url: None,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl DiscoverySettings {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Circuit breaker tuning, the serializable face of
/// [`BreakerConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BreakerSettings {
    /// Minimum windowed calls before the failure rate is evaluated.
    #[serde(default = "default_min_calls")]
    pub min_calls: usize,
    /// Failure rate in `0.0..=1.0` that opens the circuit.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    /// Rolling window size in calls.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Milliseconds the circuit stays open before probing recovery.
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    /// Trial calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,
}

fn default_min_calls() -> usize {
    5
}
fn default_failure_rate_threshold() -> f64 {
    0.5
}
fn default_window_size() -> usize {
    20
}
fn default_open_duration_ms() -> u64 {
    15_000
}
fn default_half_open_max_calls() -> usize {
    2
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            min_calls: default_min_calls(),
            failure_rate_threshold: default_failure_rate_threshold(),
            window_size: default_window_size(),
            open_duration_ms: default_open_duration_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        BreakerConfig {
            min_calls: settings.min_calls,
            failure_rate_threshold: settings.failure_rate_threshold,
            window_size: settings.window_size,
            open_duration: Duration::from_millis(settings.open_duration_ms),
            half_open_max_calls: settings.half_open_max_calls,
        }
    }
}

/// Root configuration for the whole routing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterSettings {
    /// Tier policy table.
    #[serde(default)]
    pub tiers: TierPolicies,
    /// Backend discovery sources.
    #[serde(default)]
    pub discovery: DiscoverySettings,
    /// Bridge limits and lifecycle timers, applied to every worker family.
    #[serde(default)]
    pub bridge: BridgeSettings,
    /// Circuit breaker tuning, applied per family.
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Whether predictive warming runs.
    #[serde(default = "default_warming_enabled")]
    pub warming_enabled: bool,
}

fn default_warming_enabled() -> bool {
    true
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            tiers: TierPolicies::default(),
            discovery: DiscoverySettings::default(),
            bridge: BridgeSettings::default(),
            breaker: BreakerSettings::default(),
            warming_enabled: default_warming_enabled(),
        }
    }
}

impl RouterSettings {
    /// Load from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, RouterError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RouterError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let settings: RouterSettings = toml::from_str(&raw).map_err(|e| {
            RouterError::ConfigError(format!("cannot parse {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "configuration loaded");
        Ok(settings)
    }

    /// Load from the path in `MODEL_ROUTER_CONFIG`, or defaults when unset.
    ///
    /// A set-but-unreadable path is an error; silently falling back to
    /// defaults would mask a typo in production.
    pub fn load() -> Result<Self, RouterError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_path(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Collect every validation problem; an empty vec means the settings
    /// are usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.discovery.roots.is_empty() && self.discovery.catalog_url.is_none() {
            problems.push("discovery: no roots and no catalog_url configured".to_string());
        }
        if self.discovery.poll_interval_secs == 0 {
            problems.push("discovery.poll_interval_secs must be > 0".to_string());
        }

        let limits = &self.bridge.limits;
        if limits.max_concurrency == 0 {
            problems.push("bridge.limits.max_concurrency must be > 0".to_string());
        }
        if limits.max_pending < limits.max_concurrency {
            problems.push(format!(
                "bridge.limits.max_pending ({}) must be >= max_concurrency ({})",
                limits.max_pending, limits.max_concurrency
            ));
        }
        if limits.call_timeout_ms == 0 {
            problems.push("bridge.limits.call_timeout_ms must be > 0".to_string());
        }
        if limits.max_prompt_chars == 0 {
            problems.push("bridge.limits.max_prompt_chars must be > 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.breaker.failure_rate_threshold)
            || self.breaker.failure_rate_threshold == 0.0
        {
            problems.push(format!(
                "breaker.failure_rate_threshold ({}) must be in (0.0, 1.0]",
                self.breaker.failure_rate_threshold
            ));
        }
        if self.breaker.window_size == 0 {
            problems.push("breaker.window_size must be > 0".to_string());
        }
        if self.breaker.min_calls > self.breaker.window_size {
            problems.push(format!(
                "breaker.min_calls ({}) must be <= window_size ({})",
                self.breaker.min_calls, self.breaker.window_size
            ));
        }
        if self.breaker.half_open_max_calls == 0 {
            problems.push("breaker.half_open_max_calls must be > 0".to_string());
        }

        for (name, policy) in [
            ("ultra_fast", &self.tiers.ultra_fast),
            ("fast", &self.tiers.fast),
            ("balanced", &self.tiers.balanced),
            ("powerful", &self.tiers.powerful),
            ("router", &self.tiers.router),
        ] {
            if !(0.0..=1.0).contains(&policy.min_quality_score) {
                problems.push(format!(
                    "tiers.{name}.min_quality_score ({}) must be in [0.0, 1.0]",
                    policy.min_quality_score
                ));
            }
            if policy.max_response_time_ms == 0 {
                problems.push(format!("tiers.{name}.max_response_time_ms must be > 0"));
            }
        }

        problems
    }
}

/// JSON Schema for [`RouterSettings`], for editor completion and CI
/// validation of config files.
pub fn export_schema() -> Result<String, RouterError> {
    let schema = schemars::schema_for!(RouterSettings);
    serde_json::to_string_pretty(&schema)
        .map_err(|e| RouterError::ConfigError(format!("schema export failed: {e}")))
}
