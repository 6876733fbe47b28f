//! Example demonstrating a batch of queries fanned out across sources
//! with priorities, a per-source ceiling, and cache short-circuiting.

use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use tower_upstream::{
    connector_fn, BatchOptions, CallRequest, ConfigBuilder, QueryJob, Scheduler, UpstreamError,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter("tower_upstream=info")
        .init();

    println!("=== Batch Query Example ===\n");

    let docs = connector_fn(|req: CallRequest| async move {
        sleep(Duration::from_millis(120)).await;
        Ok(json!({ "source": "docs", "matches": [req.payload] }))
    });
    let issues = connector_fn(|req: CallRequest| async move {
        sleep(Duration::from_millis(60)).await;
        Ok(json!({ "source": "issues", "matches": [req.payload] }))
    });
    let codeindex = connector_fn(|req: CallRequest| async move {
        tokio::select! {
            _ = sleep(Duration::from_millis(30)) => {
                Ok(json!({ "source": "codeindex", "matches": [req.payload] }))
            }
            _ = req.cancel.cancelled() => Err(UpstreamError::DeadlineExceeded),
        }
    });

    let config = ConfigBuilder::new()
        .workers(4)
        .source_ceiling("docs", 2)
        .build();
    let scheduler = Scheduler::builder(config)
        .connector("docs", docs)
        .connector("issues", issues)
        .connector("codeindex", codeindex)
        .build()?;

    let jobs = vec![
        QueryJob::new("q1", "docs", "fp:deploy-guide", json!("deployment guide")),
        QueryJob::new("q2", "docs", "fp:rate-limits", json!("rate limits")),
        QueryJob::new("q3", "issues", "fp:open-bugs", json!("open bugs")).with_priority(5),
        QueryJob::new("q4", "codeindex", "fp:retry-impl", json!("retry implementation")),
        QueryJob::new("q5", "docs", "fp:oncall", json!("oncall runbook")),
    ];

    let result = scheduler.submit_batch(jobs.clone(), BatchOptions::default()).await?;
    println!("batch {} finished in {:?}", result.batch_id, result.elapsed);
    for outcome in &result.outcomes {
        println!(
            "  {:10} {:?} ({:?})",
            outcome.job_id, outcome.status, outcome.latency
        );
    }

    println!("\nresubmitting the same queries...");
    let again = scheduler.submit_batch(jobs, BatchOptions::default()).await?;
    println!(
        "batch {} finished in {:?} with {} cache hits",
        again.batch_id, again.elapsed, again.counts.cache_hits
    );

    let stats = scheduler.cache_stats();
    println!("\ncache: {} hits / {} misses", stats.hits, stats.misses);
    for (tier, hits) in &stats.tier_hits {
        println!("  {tier}: {hits} hits");
    }

    scheduler.shutdown().await;
    Ok(())
}
