//! Claim ordering strategies.
//!
//! A strategy decides which queued task a worker claims next. FIFO, LIFO and
//! PRIORITY are total orders; WEIGHTED_RANDOM samples candidates with a
//! probability that grows with urgency, so low-urgency work keeps a non-zero
//! share while high-urgency work keeps arriving.

use crate::task::Task;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Strategy used when a configured name is not recognized
pub const FALLBACK_STRATEGY: ClaimStrategy = ClaimStrategy::Lifo;

/// Closed set of claim strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStrategy {
    /// Oldest task first
    Fifo,
    /// Newest task first
    Lifo,
    /// Most urgent task first, oldest among equals
    Priority,
    /// Urgency-weighted sampling
    WeightedRandom,
}

/// Name lookup table; keys are normalized (lowercase, `_` separators).
const STRATEGY_TABLE: [(&str, ClaimStrategy); 4] = [
    ("fifo", ClaimStrategy::Fifo),
    ("lifo", ClaimStrategy::Lifo),
    ("priority", ClaimStrategy::Priority),
    ("weighted_random", ClaimStrategy::WeightedRandom),
];

impl ClaimStrategy {
    /// Look up a strategy by name without falling back.
    pub fn lookup(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        STRATEGY_TABLE
            .iter()
            .find(|(key, _)| *key == normalized)
            .map(|(_, strategy)| *strategy)
    }

    /// Resolve a configured name, falling back to [`FALLBACK_STRATEGY`].
    pub fn resolve(name: &str) -> Self {
        match Self::lookup(name) {
            Some(strategy) => strategy,
            None => {
                tracing::warn!(
                    strategy = name,
                    fallback = FALLBACK_STRATEGY.name(),
                    "Unknown claim strategy, falling back"
                );
                FALLBACK_STRATEGY
            }
        }
    }

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            ClaimStrategy::Fifo => "fifo",
            ClaimStrategy::Lifo => "lifo",
            ClaimStrategy::Priority => "priority",
            ClaimStrategy::WeightedRandom => "weighted_random",
        }
    }

    /// Claim order between two tasks; `Less` means `a` is claimed first.
    ///
    /// WEIGHTED_RANDOM has no claim order of its own and compares like FIFO,
    /// which only affects how candidates are listed, never which one is sampled.
    pub fn compare(&self, order: PriorityOrder, a: &Task, b: &Task) -> Ordering {
        match self {
            ClaimStrategy::Fifo | ClaimStrategy::WeightedRandom => a
                .created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id)),
            ClaimStrategy::Lifo => b
                .created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id)),
            ClaimStrategy::Priority => order
                .urgency_cmp(a.priority, b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id)),
        }
    }

    /// Pick the index of the candidate to claim.
    ///
    /// Weighted weights are recomputed from `candidates` on every call so the
    /// distribution follows the live queue.
    pub fn select<R: Rng + ?Sized>(
        &self,
        order: PriorityOrder,
        candidates: &[Task],
        rng: &mut R,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self {
            ClaimStrategy::WeightedRandom => {
                let weights = selection_weights(order, candidates);
                match WeightedIndex::new(&weights) {
                    Ok(dist) => Some(dist.sample(rng)),
                    Err(e) => {
                        tracing::debug!("Degenerate weights ({}), sampling uniformly", e);
                        Some(rng.gen_range(0..candidates.len()))
                    }
                }
            }
            _ => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| self.compare(order, a, b))
                .map(|(index, _)| index),
        }
    }

    /// Sort tasks into claim order.
    pub fn sort(&self, order: PriorityOrder, tasks: &mut [Task]) {
        tasks.sort_by(|a, b| self.compare(order, a, b));
    }
}

impl fmt::Display for ClaimStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which end of the priority scale is most urgent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    /// Larger numbers are more urgent
    #[default]
    HigherFirst,
    /// Smaller numbers are more urgent (`1` beats `100`)
    LowerFirst,
}

impl PriorityOrder {
    /// `Less` when priority `a` is more urgent than `b`.
    pub fn urgency_cmp(&self, a: i64, b: i64) -> Ordering {
        match self {
            PriorityOrder::HigherFirst => b.cmp(&a),
            PriorityOrder::LowerFirst => a.cmp(&b),
        }
    }

    /// Least urgent priority among `priorities`
    pub fn least_urgent(&self, priorities: impl IntoIterator<Item = i64>) -> Option<i64> {
        let iter = priorities.into_iter();
        match self {
            PriorityOrder::HigherFirst => iter.min(),
            PriorityOrder::LowerFirst => iter.max(),
        }
    }
}

/// Weighted-random selection weights for `candidates`.
///
/// `weight = |priority - least_urgent| + 1`, so the least urgent candidate
/// weighs 1 and every candidate keeps a non-zero chance.
pub fn selection_weights(order: PriorityOrder, candidates: &[Task]) -> Vec<f64> {
    let Some(least) = order.least_urgent(candidates.iter().map(|t| t.priority)) else {
        return Vec::new();
    };

    candidates
        .iter()
        .map(|task| task.priority.abs_diff(least) as f64 + 1.0)
        .collect()
}
