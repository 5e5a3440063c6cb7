//! The atomic claim protocol.
//!
//! A claim runs inside one exclusive store transaction: read the claimable
//! candidates, let the strategy pick one, mark it claimed, commit. Because the
//! transaction excludes every other claimer, two concurrent claims can never
//! return the same task.

use crate::config::ClaimConfig;
use crate::error::{ClaimqError, ClaimqResult};
use crate::metrics;
use crate::store::{ClaimTransaction, SharedStore};
use crate::strategy::{ClaimStrategy, PriorityOrder};
use crate::task::Task;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::{Duration, Instant};

/// Claims tasks for one worker.
///
/// Owned by a single worker loop; the random source for WEIGHTED_RANDOM and
/// the last-claim latency are worker-local.
pub struct ClaimEngine {
    store: SharedStore,
    strategy: ClaimStrategy,
    order: PriorityOrder,
    rng: StdRng,
    last_claim_latency: Option<Duration>,
}

impl ClaimEngine {
    /// Create an engine with an entropy-seeded random source
    pub fn new(store: SharedStore, strategy: ClaimStrategy, order: PriorityOrder) -> Self {
        Self {
            store,
            strategy,
            order,
            rng: StdRng::from_entropy(),
            last_claim_latency: None,
        }
    }

    /// Create an engine from claim configuration.
    ///
    /// Unknown strategy names fall back to LIFO with a warning. A configured
    /// seed makes weighted selection reproducible.
    pub fn from_config(store: SharedStore, config: &ClaimConfig) -> Self {
        let engine = Self::new(
            store,
            ClaimStrategy::resolve(&config.strategy),
            config.priority_order,
        );
        match config.rng_seed {
            Some(seed) => engine.with_seed(seed),
            None => engine,
        }
    }

    /// Use a deterministic random source
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Active strategy
    pub fn strategy(&self) -> ClaimStrategy {
        self.strategy
    }

    /// Active priority direction
    pub fn priority_order(&self) -> PriorityOrder {
        self.order
    }

    /// Duration of the most recent claim attempt, successful or not
    pub fn last_claim_latency(&self) -> Option<Duration> {
        self.last_claim_latency
    }

    /// Claim the next task for `worker_id`.
    ///
    /// Returns `Ok(None)` when nothing is claimable or when the store is too
    /// contended to grant the transaction in time; the caller backs off in
    /// both cases. Errors are only returned for a store that cannot be used at
    /// all.
    pub async fn claim(&mut self, worker_id: &str) -> ClaimqResult<Option<Task>> {
        let started = Instant::now();
        let result = self.try_claim(worker_id).await;
        let latency = started.elapsed();

        self.last_claim_latency = Some(latency);
        metrics::record_claim_latency(worker_id, latency);

        match result {
            Ok(claimed) => Ok(claimed),
            Err(e) if e.is_transient() => {
                tracing::warn!(worker_id, "Claim skipped: {}", e);
                Ok(None)
            }
            Err(e) => {
                tracing::error!(worker_id, "Claim failed: {}", e);
                Err(e)
            }
        }
    }

    async fn try_claim(&mut self, worker_id: &str) -> ClaimqResult<Option<Task>> {
        let mut tx = self.store.begin_exclusive().await?;
        let now = Utc::now();

        let candidates = match tx.candidates(&self.strategy, self.order, now).await {
            Ok(candidates) => candidates,
            Err(e) => return Err(abandon(tx, e).await),
        };

        let selected = self
            .strategy
            .select(self.order, &candidates, &mut self.rng)
            .and_then(|index| candidates.get(index));

        let Some(selected) = selected else {
            tx.rollback().await?;
            return Ok(None);
        };

        let task = match tx.mark_claimed(selected.id, worker_id, now).await {
            Ok(task) => task,
            Err(e) => return Err(abandon(tx, e).await),
        };
        tx.commit().await?;

        tracing::debug!(
            worker_id,
            task_id = task.id,
            priority = task.priority,
            strategy = self.strategy.name(),
            candidates = candidates.len(),
            "Claimed task"
        );

        Ok(Some(task))
    }
}

/// Roll back after a failed step, keeping the original error.
async fn abandon(tx: Box<dyn ClaimTransaction>, error: ClaimqError) -> ClaimqError {
    if let Err(rollback_error) = tx.rollback().await {
        tracing::debug!("Rollback after failed claim step also failed: {}", rollback_error);
    }
    error
}
