//! # Stage: Dispatch Bridge
//!
//! ## Responsibility
//! Own one worker process per backend family: speak the NDJSON protocol,
//! enforce admission control (bounded pending + FIFO queue + per-call
//! timeout), and supervise worker lifecycle with restart-on-exit.
//!
//! ## Guarantees
//! - All bridge state lives in one event-loop task; callers interact only
//!   through channels, so there is no lock to contend or poison
//! - Every admitted call gets exactly one reply: a response, or a typed
//!   [`crate::DispatchError`]
//! - A dead worker fails fast and restarts with backoff; it never hangs
//!   callers
//!
//! ## NOT Responsible For
//! - Choosing which backend serves a request (that belongs to `router`)
//! - Fallback and degraded-response policy (that belongs to `dispatch`)

pub mod circuit_breaker;
pub mod protocol;
pub mod worker;

mod event_loop;

pub use circuit_breaker::{BreakerConfig, BreakerStatus, CircuitBreaker};
pub use event_loop::DispatchBridge;
pub use protocol::{WorkerRequest, WorkerResponse};
pub use worker::{ChildProcessLink, WorkerIo, WorkerLink, WorkerStartError};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker lifecycle states, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process spawned, waiting for the `INITIALIZED` handshake.
    Starting,
    /// Handshake complete; calls are admitted.
    Ready,
    /// Repeated restart attempts are failing; still retrying.
    Degraded,
    /// Worker exited; waiting out the restart backoff.
    Restarting,
}

/// Admission-control limits, hot-overridable via
/// [`DispatchBridge::update_limits`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeLimits {
    /// Cap on pending + queued calls; beyond it, reject with `Overloaded`.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Calls in flight with the worker at once; beyond it, queue FIFO.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-call timeout, measured from admission.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Prompts longer than this are truncated before dispatch.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    /// Requested token counts are clamped to this.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_max_pending() -> usize {
    64
}
fn default_max_concurrency() -> usize {
    4
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_max_prompt_chars() -> usize {
    4_000
}
fn default_max_output_tokens() -> u32 {
    512
}

impl Default for BridgeLimits {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            max_concurrency: default_max_concurrency(),
            call_timeout_ms: default_call_timeout_ms(),
            max_prompt_chars: default_max_prompt_chars(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl BridgeLimits {
    /// Per-call timeout as a [`Duration`].
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Full bridge tuning: limits plus lifecycle timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeSettings {
    /// Admission-control limits.
    #[serde(default)]
    pub limits: BridgeLimits,
    /// Fixed delay before restarting a dead worker.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    /// Interval of the housekeeping sweep that drops orphaned calls.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Consecutive failed restarts before the state reads `Degraded`.
    #[serde(default = "default_degraded_after_failures")]
    pub degraded_after_failures: u32,
}

fn default_restart_backoff_ms() -> u64 {
    2_000
}
fn default_sweep_interval_ms() -> u64 {
    30_000
}
fn default_degraded_after_failures() -> u32 {
    3
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            limits: BridgeLimits::default(),
            restart_backoff_ms: default_restart_backoff_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            degraded_after_failures: default_degraded_after_failures(),
        }
    }
}

impl BridgeSettings {
    /// Restart backoff as a [`Duration`].
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_defaults_match_worker_contract() {
        let limits = BridgeLimits::default();
        assert_eq!(limits.max_prompt_chars, 4_000);
        assert_eq!(limits.max_output_tokens, 512);
        assert!(limits.max_concurrency <= limits.max_pending);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let limits: BridgeLimits = toml::from_str("max_concurrency = 2").expect("decode");
        assert_eq!(limits.max_concurrency, 2);
        assert_eq!(limits.max_pending, 64);
        assert_eq!(limits.call_timeout_ms, 30_000);
    }
}
