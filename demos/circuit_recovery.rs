//! Example demonstrating the circuit breaker opening on a failing
//! source and recovering through half-open trials.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use tower_upstream::{
    connector_fn, BatchOptions, CallRequest, ConfigBuilder, QueryJob, Scheduler, SourceId,
    UpstreamError,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter("tower_upstream=info")
        .init();

    println!("=== Circuit Recovery Example ===\n");

    let healthy = Arc::new(AtomicBool::new(false));
    let healthy_cl = healthy.clone();
    let generator = connector_fn(move |req: CallRequest| {
        let ok = healthy_cl.load(Ordering::SeqCst);
        async move {
            if ok {
                Ok(json!({ "generated": req.payload }))
            } else {
                Err(UpstreamError::retryable("generation service unreachable"))
            }
        }
    });

    let mut config = ConfigBuilder::new()
        .workers(2)
        .max_retries(1)
        .breaker_cooldown(Duration::from_millis(500))
        .build();
    config.breaker.min_samples = 4;
    config.breaker.trial_successes = 2;
    config.retry.initial_delay = Duration::from_millis(10);

    let scheduler = Scheduler::builder(config)
        .connector("generator", generator)
        .build()?;
    let source = SourceId::from("generator");

    println!("--- Phase 1: the generator is down ---");
    let down = scheduler
        .submit_batch(
            vec![
                QueryJob::new("g1", "generator", "fp:g1", json!("summarize incident")),
                QueryJob::new("g2", "generator", "fp:g2", json!("draft reply")),
            ],
            BatchOptions::default(),
        )
        .await?;
    for outcome in &down.outcomes {
        println!("  {}: {:?} ({})", outcome.job_id, outcome.status, outcome.error.as_deref().unwrap_or(""));
    }
    println!("  circuit is now: {}", scheduler.circuit_status(&source));

    println!("\n--- Phase 2: short-circuited while open ---");
    let blocked = scheduler
        .submit_batch(
            vec![QueryJob::new("g3", "generator", "fp:g3", json!("retry me"))],
            BatchOptions::default(),
        )
        .await?;
    println!(
        "  {}: {:?} in {:?} (connector never invoked)",
        blocked.outcomes[0].job_id, blocked.outcomes[0].status, blocked.outcomes[0].latency
    );

    println!("\n--- Phase 3: service recovers, cooldown elapses ---");
    healthy.store(true, Ordering::SeqCst);
    sleep(Duration::from_millis(600)).await;

    for id in ["g4", "g5"] {
        let trial = scheduler
            .submit_batch(
                vec![QueryJob::new(id, "generator", format!("fp:{id}"), json!("trial"))],
                BatchOptions::default(),
            )
            .await?;
        println!(
            "  trial {}: {:?}, circuit: {}",
            id,
            trial.outcomes[0].status,
            scheduler.circuit_status(&source)
        );
    }

    for snapshot in scheduler.breaker_snapshots() {
        println!(
            "\n{}: {} calls, {} failed ({:.0}% failure rate)",
            snapshot.source,
            snapshot.total_calls,
            snapshot.failed_calls,
            snapshot.failure_rate * 100.0
        );
    }

    scheduler.shutdown().await;
    Ok(())
}
