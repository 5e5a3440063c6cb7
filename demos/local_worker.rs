use claimq::logging::init_tracing;
use claimq::prelude::*;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Resize {
    image: String,
    width: u32,
}

#[tokio::main]
async fn main() -> ClaimqResult<()> {
    let mut config = ClaimqConfig::development();
    config.claim = ClaimConfig::with_strategy("weighted_random")
        .with_priority_order(PriorityOrder::LowerFirst);
    init_tracing(&config.logging)?;

    let scheduler = Scheduler::new(config).await?;

    scheduler
        .register(
            "resize",
            TypedProcessor::new(|job: Resize| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if job.width == 0 {
                    return Err(format!("cannot resize {} to zero width", job.image));
                }
                Ok(serde_json::json!({ "image": job.image, "width": job.width }))
            }),
        )
        .await;

    for i in 0..40u32 {
        let priority = [1, 10, 50, 100][(i % 4) as usize];
        scheduler
            .enqueue(
                NewTask::new(
                    "resize",
                    serde_json::json!({ "image": format!("img-{}.png", i), "width": i * 16 }),
                )
                .with_priority(priority),
            )
            .await?;
    }

    scheduler.start().await?;
    tracing::info!("Workers started, press Ctrl+C to stop");

    scheduler.wait_for_shutdown().await?;

    let stats = scheduler.queue_stats().await?;
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        queued = stats.queued,
        "Queue after shutdown"
    );

    let report = scheduler.fairness_report(None).await?;
    tracing::info!(
        wait_gini = report.wait_gini,
        jain_index = report.jain_index,
        "Fairness: max wait by priority (ms) {:?}",
        report.max_wait_ms_by_priority
    );

    Ok(())
}
