//! Prometheus instrumentation.
//!
//! With the `metrics` feature enabled, workers record claim latency, task
//! outcomes and empty polls into a process-wide registry that
//! [`render`] exposes in the text exposition format. Without the feature the
//! recording functions compile to nothing.

use std::time::Duration;

#[cfg(feature = "metrics")]
mod registry {
    use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
    use std::sync::OnceLock;

    pub(super) struct ClaimqMetrics {
        pub(super) registry: Registry,
        pub(super) claim_latency: HistogramVec,
        pub(super) tasks_processed: IntCounterVec,
        pub(super) tasks_failed: IntCounterVec,
        pub(super) empty_polls: IntCounterVec,
    }

    impl ClaimqMetrics {
        fn new() -> prometheus::Result<Self> {
            let registry = Registry::new_custom(Some("claimq".to_string()), None)?;

            let claim_latency = HistogramVec::new(
                HistogramOpts::new("claim_latency_seconds", "Time spent in one claim attempt")
                    .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
                &["worker_id"],
            )?;
            let tasks_processed = IntCounterVec::new(
                Opts::new("tasks_processed_total", "Tasks completed successfully"),
                &["worker_id"],
            )?;
            let tasks_failed = IntCounterVec::new(
                Opts::new("tasks_failed_total", "Tasks whose processing failed"),
                &["worker_id"],
            )?;
            let empty_polls = IntCounterVec::new(
                Opts::new("empty_polls_total", "Claim attempts that found no task"),
                &["worker_id"],
            )?;

            registry.register(Box::new(claim_latency.clone()))?;
            registry.register(Box::new(tasks_processed.clone()))?;
            registry.register(Box::new(tasks_failed.clone()))?;
            registry.register(Box::new(empty_polls.clone()))?;

            Ok(Self {
                registry,
                claim_latency,
                tasks_processed,
                tasks_failed,
                empty_polls,
            })
        }
    }

    static METRICS: OnceLock<Option<ClaimqMetrics>> = OnceLock::new();

    pub(super) fn get() -> Option<&'static ClaimqMetrics> {
        METRICS
            .get_or_init(|| match ClaimqMetrics::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!("Failed to initialize metrics registry: {}", e);
                    None
                }
            })
            .as_ref()
    }
}

/// Record the duration of one claim attempt.
pub fn record_claim_latency(worker_id: &str, latency: Duration) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = registry::get() {
            metrics
                .claim_latency
                .with_label_values(&[worker_id])
                .observe(latency.as_secs_f64());
        }
    }

    #[cfg(not(feature = "metrics"))]
    let _ = (worker_id, latency);
}

/// Record the outcome of one processed task.
pub fn record_task_outcome(worker_id: &str, success: bool) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = registry::get() {
            let counter = if success {
                &metrics.tasks_processed
            } else {
                &metrics.tasks_failed
            };
            counter.with_label_values(&[worker_id]).inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    let _ = (worker_id, success);
}

/// Record a claim attempt that found nothing to do.
pub fn record_empty_poll(worker_id: &str) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = registry::get() {
            metrics.empty_polls.with_label_values(&[worker_id]).inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    let _ = worker_id;
}

/// Render all metrics in the Prometheus text format.
///
/// Returns an empty string when the `metrics` feature is disabled.
pub fn render() -> String {
    #[cfg(feature = "metrics")]
    {
        use prometheus::Encoder;

        let Some(metrics) = registry::get() else {
            return String::new();
        };

        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(e) = encoder.encode(&metrics.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    #[cfg(not(feature = "metrics"))]
    {
        String::new()
    }
}
