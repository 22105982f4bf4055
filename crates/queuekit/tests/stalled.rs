mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, fast_settings, memory_registry, memory_registry_with};
use parking_lot::Mutex;
use queuekit::policy::STALLED_REASON;
use queuekit::{Broker, DeadLetterEntry, EnqueueOptions, JobId, JobState};
use serde_json::{json, Value};
use uuid::Uuid;

/// Claim a job the way a worker would, then let its lock lapse.
async fn claim_and_abandon(broker: &queuekit::MemoryBroker, queue: &str, job_name: &str) -> JobId {
    let claimed = broker
        .claim(queue, job_name, Uuid::new_v4(), Duration::from_secs(30))
        .await
        .unwrap()
        .expect("job should be claimable");
    assert!(broker.expire_lock(queue, claimed.id));
    claimed.id
}

#[tokio::test]
async fn lapsed_lock_fails_the_job_with_stalled_reason() {
    let (broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("pdfGeneration").await.unwrap();

    let stalled: Arc<Mutex<Vec<JobId>>> = Arc::default();
    let seen = stalled.clone();
    queue.on_stalled(move |id| {
        let seen = seen.clone();
        async move { seen.lock().push(id) }
    });

    let handle = queue
        .enqueue("generateDocument", &json!({"document_id": "d-1"}), None)
        .await
        .unwrap();
    let id = claim_and_abandon(&broker, "pdfGeneration", "generateDocument").await;
    assert_eq!(id, handle.id);

    assert_eq!(queue.check_stalled().await.unwrap(), 1);
    assert_eq!(*stalled.lock(), vec![handle.id]);

    // attempts remain, so the stall consumed one and scheduled a retry
    let job = queue.get_job(handle.id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.failed_reason.as_deref(), Some(STALLED_REASON));
    assert!(matches!(job.state, JobState::Waiting | JobState::Delayed));

    // a second sweep finds nothing new
    assert_eq!(queue.check_stalled().await.unwrap(), 0);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn healthy_locks_are_left_alone() {
    let (broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    queue.enqueue("sendNotification", &json!({}), None).await.unwrap();
    broker
        .claim("email", "sendNotification", Uuid::new_v4(), Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(queue.check_stalled().await.unwrap(), 0);
    assert_eq!(queue.get_active_count().await.unwrap(), 1);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn stalled_job_without_attempts_left_is_dead_lettered() {
    let (broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    let handle = queue
        .enqueue(
            "sendWelcomeEmail",
            &json!({"to": "a@b.com"}),
            Some(EnqueueOptions::new().attempts(1)),
        )
        .await
        .unwrap();
    claim_and_abandon(&broker, "email", "sendWelcomeEmail").await;

    assert_eq!(queue.check_stalled().await.unwrap(), 1);

    let job = queue.get_job(handle.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failed_reason.as_deref(), Some("Job stalled"));

    let dlq = registry.shared_dlq().unwrap();
    let entries = dlq.list_jobs(JobState::Waiting, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry: DeadLetterEntry = serde_json::from_value(entries[0].payload.clone()).unwrap();
    assert_eq!(entry.original_job_id, handle.id);
    assert_eq!(entry.failure_reason, STALLED_REASON);
    assert_eq!(entry.attempts_made, 1);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn periodic_reaper_picks_up_stalls_on_its_own() {
    let mut settings = fast_settings();
    settings.stalled_interval = Duration::from_millis(50);
    let (broker, registry) = memory_registry_with(settings);
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    let handle = queue
        .enqueue("sendNotification", &json!({}), Some(EnqueueOptions::new().attempts(1)))
        .await
        .unwrap();
    claim_and_abandon(&broker, "email", "sendNotification").await;

    let q = queue.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let q = q.clone();
            async move {
                q.get_job(handle.id).await.unwrap().map(|j| j.state) == Some(JobState::Failed)
            }
        })
        .await
    );

    let dlq = registry.shared_dlq().unwrap();
    let d = dlq.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let d = d.clone();
            async move { d.get_job_counts().await.unwrap().waiting == 1 }
        })
        .await
    );

    registry.shutdown_all().await;
}
