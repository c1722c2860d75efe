//! Per-user conversation context.
//!
//! A rolling window of recent turns per user, used for escalation detection
//! and predictive warming. Contexts are created lazily on first sight of a
//! user id and trimmed from the front at the window bound.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::classifier::ComplexityClass;
use crate::registry::BackendId;

/// Turns retained per user.
const WINDOW: usize = 10;

/// Longest query preview stored; prompt bodies are never retained.
const PREVIEW_CHARS: usize = 80;

/// One routed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextTurn {
    /// Truncated query text, for escalation heuristics only.
    pub query_preview: String,
    /// The class the turn was classified as.
    pub class: ComplexityClass,
    /// The backend the turn was routed to.
    pub backend_id: BackendId,
}

/// Rolling per-user turn history.
#[derive(Debug, Default)]
pub struct ContextTracker {
    turns: Mutex<HashMap<String, VecDeque<ContextTurn>>>,
}

impl ContextTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn to a user's window, trimming the oldest past the bound.
    pub fn record(&self, user_id: &str, query: &str, class: ComplexityClass, backend_id: BackendId) {
        let preview: String = query.chars().take(PREVIEW_CHARS).collect();
        let mut turns = self.lock();
        let window = turns.entry(user_id.to_string()).or_default();
        window.push_back(ContextTurn {
            query_preview: preview,
            class,
            backend_id,
        });
        while window.len() > WINDOW {
            window.pop_front();
        }
    }

    /// Snapshot a user's turns, oldest first. Empty for unknown users.
    pub fn history(&self, user_id: &str) -> Vec<ContextTurn> {
        self.lock()
            .get(user_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of turns recorded for a user.
    pub fn turn_count(&self, user_id: &str) -> usize {
        self.lock().get(user_id).map_or(0, VecDeque::len)
    }

    /// Drop a user's context entirely.
    pub fn forget(&self, user_id: &str) {
        self.lock().remove(user_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<ContextTurn>>> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether complexity is strictly increasing over the most recent turns.
///
/// `classes` is oldest-first and should already include the current turn.
/// Needs at least two prior turns plus the current one; looks at the last
/// three entries.
pub fn is_escalating(classes: &[ComplexityClass]) -> bool {
    if classes.len() < 3 {
        return false;
    }
    let tail = &classes[classes.len() - 3..];
    tail.windows(2).all(|pair| pair[0] < pair[1])
}

/// Whether a conversation that opened simply has jumped to heavy work:
/// current class Complex/Expert while the first turn was Simple/Medium.
pub fn jumped_from_simple_start(first: ComplexityClass, current: ComplexityClass) -> bool {
    matches!(first, ComplexityClass::Simple | ComplexityClass::Medium)
        && matches!(current, ComplexityClass::Complex | ComplexityClass::Expert)
}
