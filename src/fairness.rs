//! Fairness and starvation analysis.
//!
//! These are offline batch metrics over tasks that have already been claimed,
//! exposed for monitoring and never consumed by the claim path:
//!
//! - [`gini`]: 0 for perfectly equal values, approaching 1 as one value dominates
//! - [`jain_index`]: 1 for perfectly equal values, `1/n` when one value dominates
//! - [`max_wait_by_priority`]: longest enqueue-to-claim wait per priority class
//!
//! [`simulate_selection`] replays strategy decisions against a fixed candidate
//! population to estimate how often each priority class would be picked.

use crate::strategy::{ClaimStrategy, PriorityOrder};
use crate::task::Task;
use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Gini coefficient of non-negative `values`.
///
/// Empty input and all-zero input are perfectly equal and yield `0.0`.
pub fn gini(values: &[f64]) -> f64 {
    let n = values.len();
    let total: f64 = values.iter().sum();
    if n == 0 || total <= 0.0 {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, value)| (i as f64 + 1.0) * value)
        .sum();
    let n = n as f64;

    (2.0 * weighted) / (n * total) - (n + 1.0) / n
}

/// Jain's fairness index of non-negative `values`.
///
/// Empty input and all-zero input yield `1.0`.
pub fn jain_index(values: &[f64]) -> f64 {
    let sum: f64 = values.iter().sum();
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();
    if values.is_empty() || sum_sq <= 0.0 {
        return 1.0;
    }
    (sum * sum) / (values.len() as f64 * sum_sq)
}

/// Longest enqueue-to-claim wait for each priority value.
///
/// Tasks that were never claimed are skipped.
pub fn max_wait_by_priority(tasks: &[Task]) -> BTreeMap<i64, Duration> {
    let mut waits: BTreeMap<i64, Duration> = BTreeMap::new();
    for task in tasks {
        let Some(wait) = task.wait_time() else {
            continue;
        };
        waits
            .entry(task.priority)
            .and_modify(|max| *max = (*max).max(wait))
            .or_insert(wait);
    }
    waits
}

/// Batch fairness metrics over claimed tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FairnessReport {
    /// Claimed tasks the report covers
    pub sample_size: usize,
    /// Claimed tasks per priority value
    pub claims_by_priority: BTreeMap<i64, u64>,
    /// Longest wait per priority value, in milliseconds
    pub max_wait_ms_by_priority: BTreeMap<i64, i64>,
    /// Mean wait per priority value, in milliseconds
    pub mean_wait_ms_by_priority: BTreeMap<i64, f64>,
    /// Gini coefficient over individual task waits
    pub wait_gini: f64,
    /// Jain's index over per-class mean waits
    pub jain_index: f64,
}

impl FairnessReport {
    /// Build a report from tasks; unclaimed tasks are ignored.
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut claims_by_priority = BTreeMap::new();
        let mut wait_sums: BTreeMap<i64, f64> = BTreeMap::new();
        let mut waits = Vec::with_capacity(tasks.len());

        for task in tasks {
            let Some(wait) = task.wait_time() else {
                continue;
            };
            let wait_ms = wait.num_milliseconds().max(0) as f64;
            waits.push(wait_ms);
            *claims_by_priority.entry(task.priority).or_insert(0u64) += 1;
            *wait_sums.entry(task.priority).or_insert(0.0) += wait_ms;
        }

        let mean_wait_ms_by_priority: BTreeMap<i64, f64> = wait_sums
            .into_iter()
            .map(|(priority, sum)| {
                let count = claims_by_priority.get(&priority).copied().unwrap_or(1).max(1);
                (priority, sum / count as f64)
            })
            .collect();

        let max_wait_ms_by_priority = max_wait_by_priority(tasks)
            .into_iter()
            .map(|(priority, wait)| (priority, wait.num_milliseconds()))
            .collect();

        let class_means: Vec<f64> = mean_wait_ms_by_priority.values().copied().collect();

        Self {
            sample_size: waits.len(),
            claims_by_priority,
            max_wait_ms_by_priority,
            wait_gini: gini(&waits),
            jain_index: jain_index(&class_means),
            mean_wait_ms_by_priority,
        }
    }

    /// Priority with the longest recorded wait
    pub fn most_starved_priority(&self) -> Option<i64> {
        self.max_wait_ms_by_priority
            .iter()
            .max_by_key(|(_, wait)| **wait)
            .map(|(priority, _)| *priority)
    }
}

/// Estimate each priority's share of claims under `strategy`.
///
/// Every trial selects one task from the same `population`, modelling a queue
/// whose claimed tasks are immediately replaced by identical arrivals. Shares
/// sum to 1 over the priorities present in `population`; classes that are
/// never picked report `0.0`.
pub fn simulate_selection<R: Rng + ?Sized>(
    strategy: ClaimStrategy,
    order: PriorityOrder,
    population: &[Task],
    trials: usize,
    rng: &mut R,
) -> BTreeMap<i64, f64> {
    let mut counts: BTreeMap<i64, u64> = population.iter().map(|t| (t.priority, 0)).collect();
    if trials == 0 {
        return counts.into_keys().map(|p| (p, 0.0)).collect();
    }

    for _ in 0..trials {
        if let Some(task) = strategy
            .select(order, population, rng)
            .and_then(|index| population.get(index))
        {
            *counts.entry(task.priority).or_insert(0) += 1;
        }
    }

    counts
        .into_iter()
        .map(|(priority, count)| (priority, count as f64 / trials as f64))
        .collect()
}
