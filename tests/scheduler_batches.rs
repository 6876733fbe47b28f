//! Batch scheduler behavior end to end: ordering, priority, isolation,
//! deadlines, and how a failing source trips and recovers its circuit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::sleep;
use tower_upstream::{
    connector_fn, BatchOptions, CallRequest, CancellationToken, CircuitState, ConfigBuilder,
    ConnectorSvc, JobStatus, QueryJob, Scheduler, SourceId, UpstreamError,
};

fn job(id: &str, source: &str) -> QueryJob {
    QueryJob::new(id, source, format!("fp-{id}"), json!(id))
}

fn sleepy_connector(delay: Duration) -> ConnectorSvc {
    connector_fn(move |req: CallRequest| async move {
        tokio::select! {
            _ = sleep(delay) => Ok(json!({ "done": req.payload })),
            _ = req.cancel.cancelled() => Err(UpstreamError::DeadlineExceeded),
        }
    })
}

#[tokio::test]
async fn outcomes_map_positionally_regardless_of_completion_order() {
    // Later jobs finish first; the result list must still be a, b, c.
    let staggered = connector_fn(|req: CallRequest| async move {
        let delay = match req.payload.as_str() {
            Some("a") => 60,
            Some("b") => 30,
            _ => 1,
        };
        sleep(Duration::from_millis(delay)).await;
        Ok(req.payload)
    });
    let scheduler = Scheduler::builder(ConfigBuilder::new().workers(3).build())
        .connector("docs", staggered)
        .build()
        .unwrap();

    let result = scheduler
        .submit_batch(
            vec![job("a", "docs"), job("b", "docs"), job("c", "docs")],
            BatchOptions::default(),
        )
        .await
        .unwrap();

    let ids: Vec<&str> = result.outcomes.iter().map(|o| o.job_id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c"]);
    assert!(result.outcomes.iter().all(|o| o.status == JobStatus::Success));
}

#[tokio::test]
async fn high_priority_jumps_pending_low_priority_jobs() {
    let completions = Arc::new(Mutex::new(Vec::<String>::new()));
    let completions_cl = completions.clone();
    let recording = connector_fn(move |req: CallRequest| {
        let completions = completions_cl.clone();
        async move {
            sleep(Duration::from_millis(40)).await;
            completions
                .lock()
                .unwrap()
                .push(req.payload.as_str().unwrap_or("").to_string());
            Ok(req.payload)
        }
    });

    // One worker: everything behind the first job is pending and must
    // be dequeued by priority.
    let scheduler = Scheduler::builder(ConfigBuilder::new().workers(1).build())
        .connector("docs", recording)
        .build()
        .unwrap();

    let mut jobs = vec![job("blocker", "docs")];
    for i in 0..4 {
        jobs.push(job(&format!("low-{i}"), "docs"));
    }
    jobs.push(job("urgent", "docs").with_priority(10));

    let result = scheduler
        .submit_batch(jobs, BatchOptions::default())
        .await
        .unwrap();
    assert!(result.outcomes.iter().all(|o| o.status == JobStatus::Success));

    let order = completions.lock().unwrap().clone();
    // The urgent job was submitted last but runs right after whatever
    // was already on the worker.
    assert!(order[1] == "urgent" || order[0] == "urgent");
    let urgent_pos = order.iter().position(|id| id == "urgent").unwrap();
    let first_low = order.iter().position(|id| id.starts_with("low-")).unwrap();
    assert!(urgent_pos < first_low);
}

#[tokio::test]
async fn saturated_source_does_not_starve_others() {
    let config = ConfigBuilder::new()
        .workers(4)
        .source_ceiling("slow", 1)
        .build();
    let scheduler = Scheduler::builder(config)
        .connector("slow", sleepy_connector(Duration::from_millis(100)))
        .connector("fast", sleepy_connector(Duration::from_millis(5)))
        .build()
        .unwrap();

    let jobs = vec![
        job("s1", "slow"),
        job("s2", "slow"),
        job("s3", "slow"),
        job("f1", "fast"),
        job("f2", "fast"),
        job("f3", "fast"),
    ];
    let result = scheduler
        .submit_batch(jobs, BatchOptions::default())
        .await
        .unwrap();

    assert!(result.outcomes.iter().all(|o| o.status == JobStatus::Success));
    // "slow" serialized at its ceiling of 1: at least 300ms in total.
    assert!(result.elapsed >= Duration::from_millis(280));
    // The fast source was never parked behind it.
    for outcome in result.outcomes.iter().filter(|o| o.job_id.starts_with('f')) {
        assert!(
            outcome.latency < Duration::from_millis(80),
            "fast job {} waited {:?}",
            outcome.job_id,
            outcome.latency
        );
    }
}

#[tokio::test]
async fn in_flight_deadline_cancels_cooperatively() {
    let scheduler = Scheduler::builder(ConfigBuilder::new().workers(2).build())
        .connector("slow", sleepy_connector(Duration::from_secs(30)))
        .build()
        .unwrap();

    let started = Instant::now();
    let result = scheduler
        .submit_batch(
            vec![job("stuck", "slow").with_deadline_in(Duration::from_millis(50))],
            BatchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.outcomes[0].status, JobStatus::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn batch_deadline_times_out_remaining_jobs() {
    let scheduler = Scheduler::builder(ConfigBuilder::new().workers(1).build())
        .connector("slow", sleepy_connector(Duration::from_secs(30)))
        .build()
        .unwrap();

    let options = BatchOptions {
        deadline: Some(Duration::from_millis(60)),
        ..Default::default()
    };
    let result = scheduler
        .submit_batch(vec![job("a", "slow"), job("b", "slow")], options)
        .await
        .unwrap();

    assert_eq!(result.counts.timed_out, 2);
    assert!(result.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn external_cancellation_behaves_like_a_deadline() {
    let scheduler = Scheduler::builder(ConfigBuilder::new().workers(1).build())
        .connector("slow", sleepy_connector(Duration::from_secs(30)))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let options = BatchOptions {
        cancel: Some(cancel),
        ..Default::default()
    };
    let result = scheduler
        .submit_batch(vec![job("a", "slow")], options)
        .await
        .unwrap();
    assert_eq!(result.outcomes[0].status, JobStatus::TimedOut);
}

#[tokio::test]
async fn failing_source_trips_breaker_then_short_circuits() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_cl = invocations.clone();
    let always_down = connector_fn(move |_req: CallRequest| {
        invocations_cl.fetch_add(1, Ordering::SeqCst);
        async move { Err::<serde_json::Value, _>(UpstreamError::retryable("connection refused")) }
    });

    // One worker so jobs run serially: 3 jobs x 2 attempts = 6 samples,
    // exactly the window minimum, so the circuit opens on the last one.
    let mut config = ConfigBuilder::new()
        .workers(1)
        .max_retries(1)
        .breaker_cooldown(Duration::from_secs(60))
        .build();
    config.breaker.min_samples = 6;
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.jitter = false;

    let scheduler = Scheduler::builder(config)
        .connector("issues", always_down)
        .build()
        .unwrap();

    let result = scheduler
        .submit_batch(
            vec![job("a", "issues"), job("b", "issues"), job("c", "issues")],
            BatchOptions::default(),
        )
        .await
        .unwrap();

    for outcome in &result.outcomes {
        assert_eq!(outcome.status, JobStatus::Failure);
        assert!(outcome.error.as_deref().unwrap().contains("retries exhausted"));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 6);
    assert_eq!(
        scheduler.circuit_status(&SourceId::from("issues")),
        CircuitState::Open
    );

    // The threshold is crossed: the next job never reaches the connector.
    let follow_up = scheduler
        .submit_batch(vec![job("d", "issues")], BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(follow_up.outcomes[0].status, JobStatus::CircuitOpen);
    assert!(follow_up.outcomes[0].latency < Duration::from_millis(50));
    assert_eq!(invocations.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn breaker_recovers_through_half_open_trials() {
    let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let healthy_cl = healthy.clone();
    let recovering = connector_fn(move |req: CallRequest| {
        let ok = healthy_cl.load(Ordering::SeqCst);
        async move {
            if ok {
                Ok(req.payload)
            } else {
                Err(UpstreamError::retryable("still down"))
            }
        }
    });

    let mut config = ConfigBuilder::new()
        .workers(1)
        .max_retries(0)
        .breaker_cooldown(Duration::from_millis(40))
        .build();
    config.breaker.min_samples = 2;
    config.breaker.trial_successes = 1;

    let scheduler = Scheduler::builder(config)
        .connector("docs", recovering)
        .build()
        .unwrap();

    let down = scheduler
        .submit_batch(vec![job("a", "docs"), job("b", "docs")], BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(down.counts.failed, 2);
    assert_eq!(
        scheduler.circuit_status(&SourceId::from("docs")),
        CircuitState::Open
    );

    healthy.store(true, Ordering::SeqCst);
    sleep(Duration::from_millis(60)).await;

    let trial = scheduler
        .submit_batch(vec![job("c", "docs")], BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(trial.outcomes[0].status, JobStatus::Success);
    assert_eq!(
        scheduler.circuit_status(&SourceId::from("docs")),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn concurrent_batches_share_the_pool() {
    let scheduler = Arc::new(
        Scheduler::builder(ConfigBuilder::new().workers(4).build())
            .connector("docs", sleepy_connector(Duration::from_millis(20)))
            .build()
            .unwrap(),
    );

    let batches = (0..3).map(|b| {
        let scheduler = scheduler.clone();
        async move {
            let jobs = (0..4)
                .map(|i| job(&format!("b{b}-j{i}"), "docs"))
                .collect();
            scheduler.submit_batch(jobs, BatchOptions::default()).await
        }
    });
    let results = futures::future::join_all(batches).await;

    for result in results {
        let result = result.unwrap();
        assert_eq!(result.counts.succeeded, 4);
        // Each batch keeps its own submission-order mapping.
        for (i, outcome) in result.outcomes.iter().enumerate() {
            assert!(outcome.job_id.ends_with(&format!("j{i}")));
        }
    }
}

#[tokio::test]
async fn stats_reflect_pool_shape() {
    let scheduler = Scheduler::builder(ConfigBuilder::new().workers(3).max_outstanding(42).build())
        .connector("docs", sleepy_connector(Duration::from_millis(1)))
        .build()
        .unwrap();

    let stats = scheduler.stats();
    assert_eq!(stats.workers, 3);
    assert_eq!(stats.max_outstanding, 42);
    assert_eq!(stats.outstanding, 0);

    scheduler
        .submit_batch(vec![job("a", "docs")], BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(scheduler.stats().outstanding, 0);
}

#[tokio::test]
async fn shutdown_stops_workers_and_resolves_pending() {
    let scheduler = Scheduler::builder(ConfigBuilder::new().workers(1).build())
        .connector("slow", sleepy_connector(Duration::from_secs(30)))
        .build()
        .unwrap();

    let scheduler = Arc::new(scheduler);
    let submitter = scheduler.clone();
    let handle = tokio::spawn(async move {
        submitter
            .submit_batch(vec![job("a", "slow")], BatchOptions::default())
            .await
    });

    sleep(Duration::from_millis(30)).await;
    scheduler.shutdown().await;

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.outcomes[0].status, JobStatus::TimedOut);
}
