//! Idle-wait calculation for the worker loop.

use crate::config::WorkerConfig;
use std::time::Duration;

/// Exponential backoff applied while the queue is empty.
///
/// Every empty poll returns the wait to sleep now and grows the next one by
/// the multiplier, up to `max_backoff`. A successful claim snaps the wait back
/// to `poll_interval` so a burst of new work is served at full speed.
#[derive(Debug, Clone)]
pub struct BackoffController {
    poll_interval: Duration,
    max_backoff: Duration,
    multiplier: f64,
    current: Duration,
}

impl BackoffController {
    /// Create a controller starting at `poll_interval`
    pub fn new(poll_interval: Duration, max_backoff: Duration, multiplier: f64) -> Self {
        Self {
            poll_interval,
            max_backoff: max_backoff.max(poll_interval),
            multiplier: if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                1.0
            },
            current: poll_interval,
        }
    }

    /// Create a controller from worker configuration
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.poll_interval(),
            config.max_backoff(),
            config.backoff_multiplier,
        )
    }

    /// Wait to apply after an empty claim; grows the next wait.
    pub fn on_empty_queue(&mut self) -> Duration {
        let wait = self.current;
        let grown = self.current.as_secs_f64() * self.multiplier;
        self.current = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        wait
    }

    /// Reset after a successful claim.
    pub fn on_claim_success(&mut self) {
        self.current = self.poll_interval;
    }

    /// The wait the next empty poll will return
    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackoffController {
        BackoffController::new(Duration::from_secs(5), Duration::from_secs(60), 1.5)
    }

    #[test]
    fn test_first_wait_is_poll_interval() {
        let mut backoff = controller();
        assert_eq!(backoff.on_empty_queue(), Duration::from_secs(5));
        assert_eq!(backoff.current(), Duration::from_millis(7_500));
    }

    #[test]
    fn test_waits_are_monotonic_and_capped() {
        let mut backoff = controller();
        let waits: Vec<Duration> = (0..20).map(|_| backoff.on_empty_queue()).collect();

        assert!(waits.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(waits.iter().all(|wait| *wait <= Duration::from_secs(60)));
        assert_eq!(*waits.last().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_success_resets_to_poll_interval() {
        let mut backoff = controller();
        for _ in 0..5 {
            backoff.on_empty_queue();
        }
        assert!(backoff.current() > Duration::from_secs(5));

        backoff.on_claim_success();
        assert_eq!(backoff.on_empty_queue(), Duration::from_secs(5));
    }

    #[test]
    fn test_degenerate_multiplier_holds_steady() {
        let mut backoff =
            BackoffController::new(Duration::from_millis(10), Duration::from_secs(1), 0.5);
        assert_eq!(backoff.on_empty_queue(), Duration::from_millis(10));
        assert_eq!(backoff.on_empty_queue(), Duration::from_millis(10));

        let mut backoff =
            BackoffController::new(Duration::from_millis(10), Duration::from_secs(1), f64::NAN);
        backoff.on_empty_queue();
        assert_eq!(backoff.current(), Duration::from_millis(10));
    }

    #[test]
    fn test_from_config() {
        let config = WorkerConfig::default()
            .with_poll_interval(100)
            .with_backoff(1_000, 2.0);
        let mut backoff = BackoffController::from_config(&config);

        let waits: Vec<u128> = (0..6).map(|_| backoff.on_empty_queue().as_millis()).collect();
        assert_eq!(waits, vec![100, 200, 400, 800, 1_000, 1_000]);
    }
}
