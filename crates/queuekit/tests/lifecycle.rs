mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, memory_registry};
use parking_lot::Mutex;
use queuekit::jobs::NewJob;
use queuekit::{
    Broker, EnqueueOptions, Job, JobError, JobOptions, JobQueue, JobState, QueueError, Retention,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing_test::traced_test;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Welcome {
    to: String,
}

async fn wait_for_state<T>(queue: &JobQueue<T>, id: i64, state: JobState) -> bool
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    eventually(Duration::from_secs(5), || {
        let q = queue.clone();
        async move { q.get_job(id).await.unwrap().map(|j| j.state) == Some(state) }
    })
    .await
}

#[tokio::test]
#[traced_test]
async fn queue_left_paused_is_resumed_on_open() {
    let (broker, registry) = memory_registry();
    broker.pause("email").await.unwrap();

    let queue = registry.create_queue::<Welcome>("email").await.unwrap();

    assert!(!queue.is_paused().await.unwrap());
    assert!(logs_contain("left paused by a previous process"));

    let done = Arc::new(AtomicU32::new(0));
    let d = done.clone();
    queue.register_worker("sendWelcomeEmail", 1, move |_job: Job<Welcome>| {
        let d = d.clone();
        async move {
            d.fetch_add(1, Ordering::SeqCst);
            Ok::<_, JobError>(())
        }
    });
    let handle = queue
        .enqueue("sendWelcomeEmail", &Welcome { to: "a@b.com".into() }, None)
        .await
        .unwrap();

    assert!(wait_for_state(&queue, handle.id, JobState::Completed).await);
    assert_eq!(done.load(Ordering::SeqCst), 1);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn enqueue_rejects_empty_job_names() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    let err = queue.enqueue("  ", &json!({}), None).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidJobName));
    assert_eq!(queue.get_job_counts().await.unwrap().waiting, 0);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn enqueue_surfaces_broker_refusal() {
    let (broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();
    broker.reject_adds("email", "out of memory");

    let err = queue
        .enqueue("sendWelcomeEmail", &json!({"to": "a@b.com"}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Rejected { ref reason, .. } if reason == "out of memory"));
    assert!(err.is_unavailable());

    registry.shutdown_all().await;
}

#[tokio::test]
async fn closed_queue_refuses_work() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    queue.close().await.unwrap();
    assert!(queue.is_closed());
    // idempotent
    queue.close().await.unwrap();

    let err = queue.enqueue("sendWelcomeEmail", &json!({}), None).await.unwrap_err();
    assert!(matches!(err, QueueError::Closed));

    registry.shutdown_all().await;
}

#[tokio::test]
async fn job_status_reports_missing_and_completed_jobs() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Welcome>("email").await.unwrap();

    let missing = queue.get_job_status(9_999).await.unwrap();
    assert!(!missing.exists);
    assert_eq!(missing.state, None);

    queue.register_worker("sendWelcomeEmail", 2, |job: Job<Welcome>| async move {
        Ok::<_, JobError>(json!({"delivered_to": job.payload.to}))
    });
    let handle = queue
        .enqueue("sendWelcomeEmail", &Welcome { to: "a@b.com".into() }, None)
        .await
        .unwrap();
    assert!(wait_for_state(&queue, handle.id, JobState::Completed).await);

    let status = queue.get_job_status(handle.id).await.unwrap();
    assert!(status.exists);
    assert_eq!(status.state, Some(JobState::Completed));
    assert_eq!(status.data, Some(json!({"to": "a@b.com"})));
    assert_eq!(status.result, Some(json!({"delivered_to": "a@b.com"})));
    assert!(status.finished_at.is_some());

    let typed = queue.get_typed_job(handle.id).await.unwrap().unwrap();
    assert_eq!(typed.payload.to, "a@b.com");

    let record = queue.get_job(handle.id).await.unwrap().unwrap();
    assert!(record.processing_duration().is_some());

    registry.shutdown_all().await;
}

#[tokio::test]
async fn progress_is_clamped_and_unknown_jobs_are_reported() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("pdfGeneration").await.unwrap();

    let handle = queue.enqueue("generateDocument", &json!({}), None).await.unwrap();
    queue.update_progress(handle.id, 150).await.unwrap();
    assert_eq!(queue.get_job_status(handle.id).await.unwrap().progress, 100);

    let err = queue.update_progress(4_242, 10).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound { id: 4_242, .. }));

    registry.shutdown_all().await;
}

#[tokio::test]
async fn pause_holds_jobs_until_resume() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    queue.pause().await.unwrap();
    assert!(queue.is_paused().await.unwrap());

    queue.register_worker("sendNotification", 1, |_job: Job<Value>| async {
        Ok::<_, JobError>(())
    });
    let handle = queue.enqueue("sendNotification", &json!({}), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.paused, 1);
    assert_eq!(counts.completed, 0);

    queue.resume().await.unwrap();
    assert!(wait_for_state(&queue, handle.id, JobState::Completed).await);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn clear_discards_pending_jobs_only() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    queue.enqueue("a", &json!({}), None).await.unwrap();
    queue.enqueue("b", &json!({}), None).await.unwrap();
    queue
        .enqueue("c", &json!({}), Some(EnqueueOptions::new().delay(Duration::from_secs(60))))
        .await
        .unwrap();

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!((counts.waiting, counts.delayed), (2, 1));

    assert_eq!(queue.clear().await.unwrap(), 3);
    assert_eq!(queue.get_job_counts().await.unwrap(), Default::default());

    registry.shutdown_all().await;
}

#[tokio::test]
#[traced_test]
async fn registering_a_job_name_twice_keeps_the_last_handler() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    queue.register_worker("sendWelcomeEmail", 1, |_job: Job<Value>| async {
        Ok::<_, JobError>("first")
    });
    queue.register_worker("sendWelcomeEmail", 1, |_job: Job<Value>| async {
        Ok::<_, JobError>("second")
    });
    assert!(logs_contain("handler registered twice"));
    assert_eq!(queue.registered_workers(), vec!["sendWelcomeEmail".to_string()]);

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(queue.enqueue("sendWelcomeEmail", &json!({}), None).await.unwrap().id);
    }
    for id in ids {
        assert!(wait_for_state(&queue, id, JobState::Completed).await);
        let status = queue.get_job_status(id).await.unwrap();
        assert_eq!(status.result, Some(json!("second")));
    }

    registry.shutdown_all().await;
}

#[tokio::test]
async fn undecodable_payload_fails_the_attempt() {
    let (broker, registry) = memory_registry();
    let queue = registry.create_queue::<Welcome>("email").await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    queue.register_worker("sendWelcomeEmail", 1, move |_job: Job<Welcome>| {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<_, JobError>(())
        }
    });

    // bypass the typed enqueue, as another producer might
    let record = broker
        .add(
            "email",
            NewJob {
                name: "sendWelcomeEmail".into(),
                payload: json!({"recipient": 12}),
                options: EnqueueOptions::new().attempts(1).resolve(queue.defaults()),
            },
        )
        .await
        .unwrap();

    assert!(wait_for_state(&queue, record.id, JobState::Failed).await);
    let job = queue.get_job(record.id).await.unwrap().unwrap();
    assert!(job
        .failed_reason
        .as_deref()
        .is_some_and(|r| r.starts_with("invalid payload")));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn handler_exceeding_its_timeout_fails() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("pdfGeneration").await.unwrap();

    queue.register_worker("generateDocument", 1, |_job: Job<Value>| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok::<_, JobError>(())
    });
    let handle = queue
        .enqueue(
            "generateDocument",
            &json!({}),
            Some(EnqueueOptions::new().attempts(1).timeout(Duration::from_millis(50))),
        )
        .await
        .unwrap();

    assert!(wait_for_state(&queue, handle.id, JobState::Failed).await);
    let job = queue.get_job(handle.id).await.unwrap().unwrap();
    assert_eq!(job.failed_reason.as_deref(), Some("job timed out after 50 ms"));

    registry.shutdown_all().await;
}

#[tokio::test]
async fn completed_listener_sees_result_even_when_job_is_pruned() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    let seen: Arc<Mutex<Vec<(i64, Value)>>> = Arc::default();
    let s = seen.clone();
    queue.on_completed(move |job, result| {
        let s = s.clone();
        async move { s.lock().push((job.id, result)) }
    });
    queue.register_worker("sendNotification", 1, |_job: Job<Value>| async {
        Ok::<_, JobError>(json!({"ok": true}))
    });

    let handle = queue
        .enqueue(
            "sendNotification",
            &json!({}),
            Some(EnqueueOptions::new().remove_on_complete(Retention::RemoveImmediately)),
        )
        .await
        .unwrap();

    let s = seen.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let s = s.clone();
            async move { !s.lock().is_empty() }
        })
        .await
    );
    assert_eq!(*seen.lock(), vec![(handle.id, json!({"ok": true}))]);
    assert!(queue.get_job(handle.id).await.unwrap().is_none());

    registry.shutdown_all().await;
}

#[tokio::test]
async fn keep_last_retention_prunes_oldest_finished_jobs() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();
    queue.register_worker("sendNotification", 1, |_job: Job<Value>| async {
        Ok::<_, JobError>(())
    });

    let opts = EnqueueOptions::new().remove_on_complete(Retention::KeepLast(2));
    let mut last = 0;
    for _ in 0..4 {
        let h = queue
            .enqueue("sendNotification", &json!({}), Some(opts.clone()))
            .await
            .unwrap();
        assert!(wait_for_state(&queue, h.id, JobState::Completed).await);
        last = h.id;
    }

    let done = queue.list_jobs(JobState::Completed, 10).await.unwrap();
    assert_eq!(done.len(), 2);
    assert_eq!(done[0].id, last);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn attempts_are_pinned_when_the_job_is_enqueued() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();

    let handle = queue.enqueue("sendNotification", &json!({}), None).await.unwrap();
    let job = queue.get_job(handle.id).await.unwrap().unwrap();
    assert_eq!(job.options.attempts, queue.defaults().attempts);

    let custom = JobOptions {
        attempts: 7,
        ..queue.defaults().clone()
    };
    let handle = queue
        .enqueue("sendNotification", &json!({}), Some(EnqueueOptions::new().attempts(7)))
        .await
        .unwrap();
    let job = queue.get_job(handle.id).await.unwrap().unwrap();
    assert_eq!(job.options, custom);

    registry.shutdown_all().await;
}
