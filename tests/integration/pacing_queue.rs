//! Pacing queue behaviour observed through its public API.

use archsheet::error::{PipelineError, ServiceError};
use archsheet::pipeline::{PacingConfig, PacingQueue, Priority, SubmitContext};
use archsheet::types::RunId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn config() -> PacingConfig {
    PacingConfig {
        min_interval_ms: 1_000,
        max_interval_ms: 10_000,
        interval_backoff_factor: 2.0,
        base_cooldown_ms: 4_000,
        max_cooldown_ms: 30_000,
        max_throttle_retries: 2,
        max_queue_size: 8,
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_submitters_are_serialised_and_spaced() {
    let queue = Arc::new(PacingQueue::<Instant>::new(config()));
    queue.start().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .submit(SubmitContext::new(format!("unit-{}", i)), || async {
                        Ok(Instant::now())
                    })
                    .await
            })
        })
        .collect();

    let mut starts = Vec::new();
    for handle in handles {
        starts.push(handle.await.unwrap().unwrap());
    }
    starts.sort();
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(1_000));
    }
    assert_eq!(queue.stats().completed, 4);
    queue.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn throttling_widens_interval_and_success_decays_it() {
    let queue = PacingQueue::<u32>::new(config());
    queue.start().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let value = queue
        .submit(SubmitContext::new("throttled"), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ServiceError::rate_limited("slow down", None))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(queue.stats().throttled, 1);

    // One throttle doubled the interval, the success halved it again
    let snapshot = queue.rate_limit_snapshot();
    assert_eq!(snapshot.consecutive_throttles, 0);
    assert_eq!(snapshot.current_interval, Duration::from_millis(1_000));
    queue.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn throttle_budget_is_bounded() {
    let queue = PacingQueue::<u32>::new(config());
    queue.start().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let result = queue
        .submit(SubmitContext::new("always-throttled"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::rate_limited("429", Some(Duration::from_secs(2)))) }
        })
        .await;

    assert!(matches!(
        result,
        Err(PipelineError::Service(ServiceError::RateLimited { .. }))
    ));
    // first try plus max_throttle_retries
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    queue.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_rejects_new_units() {
    let queue = PacingQueue::<u32>::new(config());
    queue.start().unwrap();
    let run = RunId("run-cancelled".to_string());

    queue.cancel_run(&run).await;
    let result = queue
        .submit(
            SubmitContext::new("late")
                .for_run(&run)
                .with_priority(Priority::High),
            || async { Ok(1) },
        )
        .await;
    assert!(matches!(result, Err(PipelineError::Cancelled(_))));

    queue.release_run(&run);
    let ok = queue
        .submit(SubmitContext::new("again").for_run(&run), || async { Ok(2) })
        .await;
    assert_eq!(ok.unwrap(), 2);
    queue.stop().await.unwrap();
}
