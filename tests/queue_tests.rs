//! Integration tests for the queue service against the in-memory repository.

use serde_json::json;
use std::{sync::Arc, time::Duration};
use stevedore::{
    Clock, JobStatus, MockClock, ProcessingFailure, QueueEvent, QueueService, SharedClock,
    config::QueueConfig,
    job::{STALLED_ATTEMPTS_EXHAUSTED, STALLED_LIMIT_EXCEEDED},
    options::JobOptionsPatch,
    repository::{InMemoryJobRepository, JobRepository},
    retry::BackoffStrategy,
};
use std::sync::atomic::Ordering;
use test_utils::{FaultyRepository, faulty_repository};
use tokio::sync::broadcast;


struct Harness {
    clock: MockClock,
    repo: Arc<InMemoryJobRepository>,
    queue: Arc<QueueService<InMemoryJobRepository>>,
}

fn harness() -> Harness {
    let clock = MockClock::new();
    let shared: SharedClock = Arc::new(clock.clone());
    let repo = Arc::new(InMemoryJobRepository::with_clock(shared.clone()));
    let queue = Arc::new(
        QueueService::new("emails", repo.clone(), QueueConfig::default()).with_clock(shared),
    );
    Harness { clock, repo, queue }
}

fn kinds(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
    }
    kinds
}

#[tokio::test]
async fn test_send_email_end_to_end() {
    let h = harness();

    let job = h
        .queue
        .add("send-email", json!({"to": "a@b.com"}), JobOptionsPatch::new())
        .await
        .unwrap();
    assert_eq!(job.status(), JobStatus::Waiting);

    let claimed = h
        .queue
        .fetch_next_job_and_lock("w1", Duration::from_millis(10_000))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id(), job.id());
    assert_eq!(claimed.status(), JobStatus::Active);
    assert_eq!(claimed.attempts_made(), 1);
    assert_eq!(claimed.worker_id(), Some("w1"));
    assert_eq!(claimed.payload(), &json!({"to": "a@b.com"}));

    assert!(
        h.queue
            .mark_job_as_completed(job.id(), "w1", json!({"status": "sent"}))
            .await
            .unwrap()
    );

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Completed);
    assert_eq!(stored.return_value(), Some(&json!({"status": "sent"})));
    assert!(stored.lock_until().is_none());
    assert!(stored.worker_id().is_none());
    assert!(stored.finished_on().is_some());
}

#[tokio::test]
async fn test_exclusive_claim_between_two_workers() {
    let h = harness();
    h.queue
        .add("work", json!({}), JobOptionsPatch::new())
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        h.queue
            .fetch_next_job_and_lock("worker-a", Duration::from_secs(30)),
        h.queue
            .fetch_next_job_and_lock("worker-b", Duration::from_secs(30)),
    );
    let claimed = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn test_exclusive_claim_under_contention() {
    let h = harness();
    h.queue
        .add("work", json!({}), JobOptionsPatch::new())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let queue = h.queue.clone();
        handles.push(tokio::spawn(async move {
            queue
                .fetch_next_job_and_lock(&format!("worker-{}", i), Duration::from_secs(30))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_expired_lock_can_be_reclaimed() {
    let h = harness();
    let job = h
        .queue
        .add("work", json!({}), JobOptionsPatch::new().attempts(3))
        .await
        .unwrap();

    h.queue
        .fetch_next_job_and_lock("worker-a", Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(6));

    let lock_until = h.clock.now() + chrono::Duration::seconds(5);
    assert!(
        h.repo
            .acquire_lock(job.id(), "worker-b", lock_until)
            .await
            .unwrap()
    );

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.worker_id(), Some("worker-b"));
    assert_eq!(stored.attempts_made(), 2);

    // Worker a no longer owns the job.
    assert!(
        !h.queue
            .mark_job_as_completed(job.id(), "worker-a", json!(null))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_exponential_retry_until_failed() {
    let h = harness();
    let job = h
        .queue
        .add(
            "work",
            json!({}),
            JobOptionsPatch::new()
                .attempts(3)
                .backoff(BackoffStrategy::exponential(Duration::from_millis(100))),
        )
        .await
        .unwrap();

    // First attempt fails: delayed by the base delay.
    h.queue
        .fetch_next_job_and_lock("w1", Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    h.queue
        .mark_job_as_failed(job.id(), "w1", &ProcessingFailure::new("error 1"))
        .await
        .unwrap();

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Delayed);
    assert!(stored.delay_until().unwrap() >= h.clock.now() + chrono::Duration::milliseconds(100));
    assert!(stored.lock_until().is_none());
    assert_eq!(stored.failed_reason(), Some("error 1"));

    // Not eligible until the delay elapses.
    assert!(
        h.queue
            .fetch_next_job_and_lock("w1", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none()
    );

    // Second attempt fails: delay doubles.
    h.clock.advance(chrono::Duration::milliseconds(100));
    let claimed = h
        .queue
        .fetch_next_job_and_lock("w1", Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.attempts_made(), 2);
    assert!(claimed.is_retry());
    h.queue
        .mark_job_as_failed(job.id(), "w1", &ProcessingFailure::new("error 2"))
        .await
        .unwrap();
    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(
        stored.delay_until(),
        Some(h.clock.now() + chrono::Duration::milliseconds(200))
    );

    // Third attempt fails: out of attempts.
    h.clock.advance(chrono::Duration::milliseconds(200));
    h.queue
        .fetch_next_job_and_lock("w1", Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    h.queue
        .mark_job_as_failed(job.id(), "w1", &ProcessingFailure::new("error 3"))
        .await
        .unwrap();

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Failed);
    assert_eq!(stored.attempts_made(), 3);
    assert_eq!(stored.failed_reason(), Some("error 3"));
    assert!(stored.finished_on().is_some());

    let failed = h
        .queue
        .get_jobs_by_status(&[JobStatus::Failed], 0, 10, true)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn test_stalled_job_with_attempts_left_is_requeued() {
    let h = harness();
    let mut rx = h.queue.subscribe();
    let job = h
        .queue
        .add("work", json!({}), JobOptionsPatch::new().attempts(2))
        .await
        .unwrap();
    h.queue
        .fetch_next_job_and_lock("crashed", Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(h.queue.run_maintenance_cycle().await.unwrap(), 0);

    h.clock.advance(chrono::Duration::seconds(11));
    assert_eq!(h.queue.run_maintenance_cycle().await.unwrap(), 1);

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Waiting);
    assert!(stored.lock_until().is_none());
    assert!(stored.worker_id().is_none());
    assert_eq!(stored.stalled_count(), 1);
    assert_eq!(
        kinds(&mut rx),
        vec!["job.added", "job.active", "job.stalled"]
    );

    let reclaimed = h
        .queue
        .fetch_next_job_and_lock("healthy", Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.attempts_made(), 2);
}

#[tokio::test]
async fn test_stalled_job_without_attempts_left_fails() {
    let h = harness();
    let job = h
        .queue
        .add("work", json!({}), JobOptionsPatch::new())
        .await
        .unwrap();
    h.queue
        .fetch_next_job_and_lock("crashed", Duration::from_secs(10))
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::seconds(11));
    assert_eq!(h.queue.run_maintenance_cycle().await.unwrap(), 1);

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Failed);
    assert_eq!(stored.failed_reason(), Some(STALLED_ATTEMPTS_EXHAUSTED));
    assert!(stored.lock_until().is_none());
}

#[tokio::test]
async fn test_stall_limit_fails_job_with_attempts_left() {
    let h = harness();
    let job = h
        .queue
        .add(
            "work",
            json!({}),
            JobOptionsPatch::new().attempts(10).max_stalled_count(1),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        h.queue
            .fetch_next_job_and_lock("crashed", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(11));
        h.queue.run_maintenance_cycle().await.unwrap();
    }

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Failed);
    assert_eq!(stored.failed_reason(), Some(STALLED_LIMIT_EXCEEDED));
    assert_eq!(stored.stalled_count(), 2);
}

#[tokio::test]
async fn test_completion_by_non_owner_is_ignored() {
    let h = harness();
    let job = h
        .queue
        .add("work", json!({}), JobOptionsPatch::new())
        .await
        .unwrap();
    h.queue
        .fetch_next_job_and_lock("owner", Duration::from_secs(10))
        .await
        .unwrap();
    let before = h.queue.get_job(job.id()).await.unwrap().unwrap();

    let mut rx = h.queue.subscribe();
    assert!(
        !h.queue
            .mark_job_as_completed(job.id(), "intruder", json!("stolen"))
            .await
            .unwrap()
    );
    assert!(
        !h.queue
            .mark_job_as_failed(job.id(), "intruder", &ProcessingFailure::new("nope"))
            .await
            .unwrap()
    );

    let after = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(after, before);
    assert!(kinds(&mut rx).is_empty());
}

#[tokio::test]
async fn test_priority_then_age_ordering() {
    let h = harness();
    let low = h
        .queue
        .add("low", json!({}), JobOptionsPatch::new().priority(5))
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(1));
    let urgent_old = h
        .queue
        .add("urgent-1", json!({}), JobOptionsPatch::new().priority(1))
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(1));
    let urgent_new = h
        .queue
        .add("urgent-2", json!({}), JobOptionsPatch::new().priority(1))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(job) = h
        .queue
        .fetch_next_job_and_lock("w1", Duration::from_secs(10))
        .await
        .unwrap()
    {
        order.push(job.id().clone());
    }
    assert_eq!(
        order,
        vec![
            urgent_old.id().clone(),
            urgent_new.id().clone(),
            low.id().clone()
        ]
    );
}

#[tokio::test]
async fn test_maintenance_loop_recovers_in_background() {
    let clock = MockClock::new();
    let shared: SharedClock = Arc::new(clock.clone());
    let repo = Arc::new(InMemoryJobRepository::with_clock(shared.clone()));
    let mut config = QueueConfig::default();
    config.stalled_jobs.check_interval = Duration::from_millis(20);
    let queue = Arc::new(QueueService::new("bg", repo, config).with_clock(shared));

    let job = queue
        .add("work", json!({}), JobOptionsPatch::new().attempts(2))
        .await
        .unwrap();
    queue
        .fetch_next_job_and_lock("crashed", Duration::from_secs(1))
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(2));

    let mut rx = queue.subscribe();
    queue.start_maintenance().await;

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind(), "job.stalled");
    assert_eq!(event.job_id(), Some(job.id()));

    queue.close().await;
    assert!(queue.is_closed());
}

struct FaultyHarness {
    clock: MockClock,
    repo: Arc<FaultyRepository>,
    queue: Arc<QueueService<FaultyRepository>>,
}

fn faulty_harness(config: QueueConfig) -> FaultyHarness {
    let clock = MockClock::new();
    let shared: SharedClock = Arc::new(clock.clone());
    let repo = faulty_repository(shared.clone());
    let queue = Arc::new(QueueService::new("flaky", repo.clone(), config).with_clock(shared));
    FaultyHarness { clock, repo, queue }
}

async fn next_of(rx: &mut broadcast::Receiver<QueueEvent>, kind: &str) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} event", kind))
}

#[tokio::test]
async fn test_stall_sweep_does_not_undo_a_completion() {
    let h = faulty_harness(QueueConfig::default());
    let job = h
        .queue
        .add("work", json!({}), JobOptionsPatch::new().attempts(3))
        .await
        .unwrap();
    h.queue
        .fetch_next_job_and_lock("slow", Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(11));

    // The slow worker finishes between the stall scan and the sweep's write.
    h.repo.complete_after_stall_scan.store(true, Ordering::SeqCst);
    let mut rx = h.queue.subscribe();
    assert_eq!(h.queue.run_maintenance_cycle().await.unwrap(), 0);

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Completed);
    assert_eq!(stored.return_value(), Some(&json!("late but done")));
    assert!(stored.finished_on().is_some());
    assert_eq!(stored.stalled_count(), 0);
    assert!(kinds(&mut rx).is_empty());
}

#[tokio::test]
async fn test_completion_after_job_changed_hands_is_ignored() {
    let h = faulty_harness(QueueConfig::default());
    let job = h
        .queue
        .add("work", json!({}), JobOptionsPatch::new().attempts(3))
        .await
        .unwrap();
    h.queue
        .fetch_next_job_and_lock("w1", Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    // The job is requeued and claimed by another worker right after w1 read it.
    h.repo.steal_after_read.store(true, Ordering::SeqCst);
    let mut rx = h.queue.subscribe();
    assert!(
        !h.queue
            .mark_job_as_completed(job.id(), "w1", json!("stale"))
            .await
            .unwrap()
    );

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Active);
    assert_eq!(stored.worker_id(), Some("thief"));
    assert!(stored.return_value().is_none());
    assert!(stored.finished_on().is_none());
    assert!(kinds(&mut rx).is_empty());
}

#[tokio::test]
async fn test_maintenance_loop_survives_repository_errors() {
    let mut config = QueueConfig::default();
    config.stalled_jobs.check_interval = Duration::from_millis(20);
    let h = faulty_harness(config);

    let job = h
        .queue
        .add("work", json!({}), JobOptionsPatch::new().attempts(2))
        .await
        .unwrap();
    h.queue
        .fetch_next_job_and_lock("crashed", Duration::from_secs(1))
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(2));

    h.repo.fail_stall_scan.store(true, Ordering::SeqCst);
    let mut rx = h.queue.subscribe();
    h.queue.start_maintenance().await;

    for _ in 0..2 {
        match next_of(&mut rx, "queue.error").await {
            QueueEvent::QueueError { queue_name, error } => {
                assert_eq!(queue_name, "flaky");
                assert!(error.contains("connection reset"));
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    // Once storage is back, the same loop recovers the stalled job.
    h.repo.fail_stall_scan.store(false, Ordering::SeqCst);
    let event = next_of(&mut rx, "job.stalled").await;
    assert_eq!(event.job_id(), Some(job.id()));

    let stored = h.queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Waiting);

    h.queue.close().await;
}
