//! Circuit breaker guarding one worker family.
//!
//! Stops dispatch to a failing worker before the failure cascades into
//! queue buildup.
//!
//! ## States
//! - **Closed**: calls flow through; results feed a rolling window
//! - **Open**: calls rejected immediately for a fixed duration
//! - **Half-Open**: a limited number of trial calls probe recovery
//!
//! The trigger is failure *rate* over the rolling window, not a consecutive
//! count, so a worker that fails every other call still trips the breaker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Minimum calls in the window before the failure rate is evaluated.
    pub min_calls: usize,
    /// Failure rate in `0.0..=1.0` that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Rolling window size in calls.
    pub window_size: usize,
    /// How long the circuit stays open before probing recovery.
    pub open_duration: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_max_calls: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_calls: 5,
            failure_rate_threshold: 0.5,
            window_size: 20,
            open_duration: Duration::from_secs(15),
            half_open_max_calls: 2,
        }
    }
}

/// Current breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    /// Calls flow through normally.
    Closed,
    /// Calls are rejected without reaching the worker.
    Open,
    /// Limited trial calls probe whether the worker recovered.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    status: BreakerStatus,
    /// Recent outcomes, true = success. Bounded to `window_size`.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    /// Trial calls admitted since entering half-open.
    half_open_admitted: usize,
}

/// Cloneable handle to one breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<RwLock<BreakerState>>,
    config: BreakerConfig,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("config", &self.config).finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(BreakerState {
                status: BreakerStatus::Closed,
                window: VecDeque::new(),
                opened_at: None,
                last_state_change: Instant::now(),
                half_open_admitted: 0,
            })),
            config,
        }
    }

    /// Ask whether a call may proceed right now.
    ///
    /// Returns `false` without touching the worker when the circuit is open
    /// (or half-open with the trial budget spent). An open circuit whose
    /// cool-off has elapsed transitions to half-open here.
    pub async fn check(&self) -> bool {
        let mut state = self.state.write().await;
        match state.status {
            BreakerStatus::Closed => true,
            BreakerStatus::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_duration {
                    // Clear the window so the close decision only sees
                    // post-recovery results.
                    state.status = BreakerStatus::HalfOpen;
                    state.window.clear();
                    state.half_open_admitted = 1;
                    state.last_state_change = Instant::now();
                    info!("circuit breaker: half-open, admitting trial call");
                    true
                } else {
                    debug!("circuit breaker: call rejected (open)");
                    false
                }
            }
            BreakerStatus::HalfOpen => {
                if state.half_open_admitted < self.config.half_open_max_calls {
                    state.half_open_admitted += 1;
                    true
                } else {
                    debug!("circuit breaker: trial budget spent, call rejected");
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        push_result(&mut state.window, true, self.config.window_size);

        if state.status == BreakerStatus::HalfOpen {
            let trials_done = state.window.len() >= self.config.half_open_max_calls;
            let all_ok = state.window.iter().all(|&ok| ok);
            if trials_done && all_ok {
                state.status = BreakerStatus::Closed;
                state.opened_at = None;
                state.half_open_admitted = 0;
                state.last_state_change = Instant::now();
                info!("circuit breaker: closed (worker recovered)");
            }
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        push_result(&mut state.window, false, self.config.window_size);

        match state.status {
            BreakerStatus::Closed => {
                let rate = failure_rate(&state.window);
                if state.window.len() >= self.config.min_calls
                    && rate >= self.config.failure_rate_threshold
                {
                    state.status = BreakerStatus::Open;
                    state.opened_at = Some(Instant::now());
                    state.last_state_change = Instant::now();
                    warn!(
                        failure_rate = rate,
                        threshold = self.config.failure_rate_threshold,
                        "circuit breaker: open"
                    );
                }
            }
            BreakerStatus::HalfOpen => {
                state.status = BreakerStatus::Open;
                state.opened_at = Some(Instant::now());
                state.half_open_admitted = 0;
                state.last_state_change = Instant::now();
                warn!("circuit breaker: reopened (trial call failed)");
            }
            BreakerStatus::Open => {}
        }
    }

    /// Current status.
    pub async fn status(&self) -> BreakerStatus {
        self.state.read().await.status
    }

    /// Point-in-time statistics.
    pub async fn stats(&self) -> BreakerStats {
        let state = self.state.read().await;
        BreakerStats {
            status: state.status,
            window_calls: state.window.len(),
            failure_rate: failure_rate(&state.window),
            time_in_current_state: state.last_state_change.elapsed(),
        }
    }

    /// Manually reset to closed, clearing the window.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.status = BreakerStatus::Closed;
        state.window.clear();
        state.opened_at = None;
        state.half_open_admitted = 0;
        state.last_state_change = Instant::now();
        info!("circuit breaker: manually reset");
    }

    /// Force the circuit open, e.g. for maintenance.
    pub async fn trip(&self) {
        let mut state = self.state.write().await;
        state.status = BreakerStatus::Open;
        state.opened_at = Some(Instant::now());
        state.last_state_change = Instant::now();
        warn!("circuit breaker: manually tripped");
    }
}

/// Breaker statistics snapshot.
#[derive(Debug)]
pub struct BreakerStats {
    /// Current state.
    pub status: BreakerStatus,
    /// Calls currently in the rolling window.
    pub window_calls: usize,
    /// Fraction of windowed calls that failed.
    pub failure_rate: f64,
    /// Wall-clock time in the current state.
    pub time_in_current_state: Duration,
}

fn push_result(window: &mut VecDeque<bool>, ok: bool, cap: usize) {
    window.push_back(ok);
    while window.len() > cap {
        window.pop_front();
    }
}

fn failure_rate(window: &VecDeque<bool>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let failures = window.iter().filter(|&&ok| !ok).count();
    failures as f64 / window.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(open_ms: u64) -> BreakerConfig {
        BreakerConfig {
            min_calls: 4,
            failure_rate_threshold: 0.5,
            window_size: 10,
            open_duration: Duration::from_millis(open_ms),
            half_open_max_calls: 2,
        }
    }

    #[tokio::test]
    async fn test_opens_on_failure_rate_not_consecutive_failures() {
        let breaker = CircuitBreaker::new(config(60_000));

        // Alternating results: rate hits 0.5 with 4+ calls in window.
        breaker.record_success().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;

        assert_eq!(breaker.status().await, BreakerStatus::Open);
        assert!(!breaker.check().await);
    }

    #[tokio::test]
    async fn test_stays_closed_below_min_calls() {
        let breaker = CircuitBreaker::new(config(60_000));
        breaker.record_failure().await;
        breaker.record_failure().await;
        // 100% failure rate but only 2 calls in the window.
        assert_eq!(breaker.status().await, BreakerStatus::Closed);
        assert!(breaker.check().await);
    }

    #[tokio::test]
    async fn test_half_open_after_cooloff_then_closes_on_success() {
        let breaker = CircuitBreaker::new(config(50));
        for _ in 0..4 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.status().await, BreakerStatus::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Cool-off elapsed: trial calls admitted up to the budget.
        assert!(breaker.check().await);
        assert_eq!(breaker.status().await, BreakerStatus::HalfOpen);
        assert!(breaker.check().await);
        // Third call exceeds the trial budget.
        assert!(!breaker.check().await);

        breaker.record_success().await;
        breaker.record_success().await;
        assert_eq!(breaker.status().await, BreakerStatus::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(config(50));
        for _ in 0..4 {
            breaker.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.check().await);

        breaker.record_failure().await;
        assert_eq!(breaker.status().await, BreakerStatus::Open);
        assert!(!breaker.check().await);
    }

    #[tokio::test]
    async fn test_reset_and_trip() {
        let breaker = CircuitBreaker::new(config(60_000));
        breaker.trip().await;
        assert_eq!(breaker.status().await, BreakerStatus::Open);
        breaker.reset().await;
        assert_eq!(breaker.status().await, BreakerStatus::Closed);
        assert!(breaker.check().await);
    }

    #[tokio::test]
    async fn test_stats_reflect_window() {
        let breaker = CircuitBreaker::new(config(60_000));
        breaker.record_success().await;
        breaker.record_failure().await;
        let stats = breaker.stats().await;
        assert_eq!(stats.window_calls, 2);
        assert!((stats.failure_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.status, BreakerStatus::Closed);
    }
}
