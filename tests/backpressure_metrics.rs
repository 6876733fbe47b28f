//! Backpressure, metric emission, and write-back TTL overrides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use tower_upstream::{
    collector_fn, connector_fn, BatchOptions, CallRequest, ConfigBuilder, JobStatus, MetricRecord,
    QueryJob, Scheduler, SourceId, UpstreamError,
};

fn job(id: &str, source: &str) -> QueryJob {
    QueryJob::new(id, source, format!("fp-{id}"), json!(id))
}

#[tokio::test]
async fn submissions_beyond_outstanding_limit_are_rejected() {
    let slow = connector_fn(|req: CallRequest| async move {
        tokio::select! {
            _ = sleep(Duration::from_millis(200)) => Ok(req.payload),
            _ = req.cancel.cancelled() => Err(UpstreamError::DeadlineExceeded),
        }
    });
    let config = ConfigBuilder::new()
        .workers(2)
        .max_outstanding(2)
        .build();
    let scheduler = Arc::new(
        Scheduler::builder(config)
            .connector("docs", slow)
            .build()
            .unwrap(),
    );

    let occupant = scheduler.clone();
    let first = tokio::spawn(async move {
        occupant
            .submit_batch(vec![job("a", "docs"), job("b", "docs")], BatchOptions::default())
            .await
    });
    sleep(Duration::from_millis(50)).await;

    // The pool is full; new work queues nowhere and is rejected whole.
    let err = scheduler
        .submit_batch(vec![job("c", "docs")], BatchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::CapacityExceeded { .. }));

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.counts.succeeded, 2);

    // Capacity frees up once outcomes are terminal.
    let retry = scheduler
        .submit_batch(vec![job("c", "docs")], BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(retry.counts.succeeded, 1);
}

#[tokio::test]
async fn scheduler_emits_outcome_counters_and_latency() {
    let records = Arc::new(Mutex::new(Vec::<MetricRecord>::new()));
    let records_cl = records.clone();
    let collector = collector_fn(move |record: MetricRecord| {
        let records = records_cl.clone();
        async move {
            records.lock().unwrap().push(record);
            Ok(())
        }
    });

    let scheduler = Scheduler::builder(ConfigBuilder::new().workers(2).build())
        .connector(
            "docs",
            connector_fn(|req: CallRequest| async move { Ok(req.payload) }),
        )
        .collector(collector)
        .build()
        .unwrap();

    scheduler
        .submit_batch(vec![job("a", "docs")], BatchOptions::default())
        .await
        .unwrap();

    // Same fingerprint again: served from cache.
    let mut repeat = job("b", "docs");
    repeat.fingerprint = "fp-a".to_string();
    scheduler
        .submit_batch(vec![repeat], BatchOptions::default())
        .await
        .unwrap();

    let records = records.lock().unwrap();
    let counter = |name: &str| {
        records
            .iter()
            .filter_map(|r| match r {
                MetricRecord::Counter { name: n, value } if *n == name => Some(*value),
                _ => None,
            })
            .sum::<u64>()
    };
    assert_eq!(counter("jobs_succeeded"), 1);
    assert_eq!(counter("jobs_cache_hit"), 1);
    assert!(records
        .iter()
        .any(|r| matches!(r, MetricRecord::Histogram { name: "job_latency_ms", .. })));
}

#[tokio::test]
async fn ttl_override_shortens_write_back_lifetime() {
    let invoked = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let invoked_cl = invoked.clone();
    let counting = connector_fn(move |req: CallRequest| {
        invoked_cl.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move { Ok(req.payload) }
    });
    let scheduler = Scheduler::builder(ConfigBuilder::new().workers(1).build())
        .connector("docs", counting)
        .build()
        .unwrap();

    let options = BatchOptions {
        ttl_overrides: HashMap::from([(SourceId::from("docs"), Duration::from_millis(40))]),
        ..Default::default()
    };
    scheduler
        .submit_batch(vec![job("a", "docs")], options)
        .await
        .unwrap();

    sleep(Duration::from_millis(70)).await;

    // The default docs TTL is half an hour; the override must have won.
    let mut repeat = job("b", "docs");
    repeat.fingerprint = "fp-a".to_string();
    let result = scheduler
        .submit_batch(vec![repeat], BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(result.outcomes[0].status, JobStatus::Success);
    assert_eq!(invoked.load(std::sync::atomic::Ordering::SeqCst), 2);
}
