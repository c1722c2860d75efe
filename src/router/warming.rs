//! Predictive backend warming.
//!
//! The router fires warm-up hints onto a bounded queue; a background loop
//! drains it with a small concurrency cap. Warming is strictly best-effort:
//! a full queue drops the hint, a failed warm-up is logged, and neither is
//! ever visible to the request path.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::registry::Backend;

/// Warm-up hints buffered before the loop drains them.
const QUEUE_CAPACITY: usize = 32;

/// Warm-ups allowed to run at once.
const MAX_CONCURRENT_WARMUPS: usize = 2;

/// Performs one warm-up, typically by pushing a trivial prompt through the
/// backend's bridge.
#[async_trait]
pub trait Warmer: Send + Sync {
    /// Warm one backend. Errors are logged by the loop and otherwise
    /// ignored.
    async fn warm(&self, backend: &Backend) -> Result<(), String>;
}

/// Handle for enqueueing warm-up hints.
#[derive(Clone)]
pub struct WarmingHandle {
    hints: mpsc::Sender<Backend>,
}

impl std::fmt::Debug for WarmingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmingHandle").finish()
    }
}

impl WarmingHandle {
    /// Spawn the warming loop and return its handle.
    pub fn spawn(warmer: Arc<dyn Warmer>) -> Self {
        let (hints_tx, mut hints_rx) = mpsc::channel::<Backend>(QUEUE_CAPACITY);
        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_WARMUPS));

        tokio::spawn(async move {
            while let Some(backend) = hints_rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    return;
                };
                let warmer = Arc::clone(&warmer);
                tokio::spawn(async move {
                    debug!(backend = %backend.id, tier = %backend.tier, "warming backend");
                    if let Err(e) = warmer.warm(&backend).await {
                        warn!(backend = %backend.id, error = %e, "warm-up failed");
                    }
                    drop(permit);
                });
            }
        });

        Self { hints: hints_tx }
    }

    /// Enqueue a warm-up hint. Returns `false` when the queue is full and
    /// the hint was dropped.
    pub fn request(&self, backend: Backend) -> bool {
        match self.hints.try_send(backend) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "warming queue full, hint dropped");
                false
            }
        }
    }
}
