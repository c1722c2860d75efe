//! # Stage: Router
//!
//! ## Responsibility
//! Turn a classified request into a [`RoutingDecision`]: pick the primary
//! backend by tier search, choose a distinct fallback, estimate latency,
//! and queue predictive warm-ups based on the conversation's trajectory.
//!
//! ## Guarantees
//! - Routing never blocks on I/O: classification is pure, registry reads
//!   are snapshots, warming is fire-and-forget
//! - The only error is an empty registry; constraints and empty tiers
//!   degrade instead of failing
//!
//! ## NOT Responsible For
//! - Executing the call (that belongs to `dispatch`)
//! - Discovering or benchmarking backends (that belongs to `registry`)

pub mod context;
pub mod warming;

#[allow(clippy::module_inception)]
mod router;

pub use context::{ContextTracker, ContextTurn};
pub use router::{ModelRouter, RouteConstraints, RouteRequest, RoutingDecision};
pub use warming::{Warmer, WarmingHandle};
