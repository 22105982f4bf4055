mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{eventually, memory_registry};
use queuekit::{Job, JobError, JobQueue};
use serde_json::{json, Value};

struct InFlight {
    now: AtomicUsize,
    max: AtomicUsize,
    done: AtomicUsize,
}

fn tracked_worker(
    queue: &JobQueue<Value>,
    job_name: &str,
    concurrency: usize,
    work: Duration,
) -> Arc<InFlight> {
    let stats = Arc::new(InFlight {
        now: AtomicUsize::new(0),
        max: AtomicUsize::new(0),
        done: AtomicUsize::new(0),
    });
    register_tracked(queue, job_name, concurrency, work, stats.clone());
    stats
}

fn register_tracked(
    queue: &JobQueue<Value>,
    job_name: &str,
    concurrency: usize,
    work: Duration,
    stats: Arc<InFlight>,
) {
    queue.register_worker(job_name, concurrency, move |_job: Job<Value>| {
        let s = stats.clone();
        async move {
            let running = s.now.fetch_add(1, Ordering::SeqCst) + 1;
            s.max.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(work).await;
            s.now.fetch_sub(1, Ordering::SeqCst);
            s.done.fetch_add(1, Ordering::SeqCst);
            Ok::<_, JobError>(())
        }
    });
}

async fn wait_done(stats: &Arc<InFlight>, n: usize) -> bool {
    eventually(Duration::from_secs(10), || {
        let s = stats.clone();
        async move { s.done.load(Ordering::SeqCst) == n }
    })
    .await
}

#[tokio::test]
async fn concurrency_one_processes_jobs_serially() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("imports").await.unwrap();
    let stats = tracked_worker(&queue, "processCsv", 1, Duration::from_millis(100));

    let started = Instant::now();
    for i in 0..5 {
        queue
            .enqueue("processCsv", &json!({"file": format!("batch-{i}.csv")}), None)
            .await
            .unwrap();
    }

    assert!(wait_done(&stats, 5).await);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(stats.max.load(Ordering::SeqCst), 1);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn concurrency_bounds_parallel_handlers() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();
    let stats = tracked_worker(&queue, "sendWelcomeEmail", 3, Duration::from_millis(80));

    for _ in 0..9 {
        queue.enqueue("sendWelcomeEmail", &json!({}), None).await.unwrap();
    }

    assert!(wait_done(&stats, 9).await);
    assert_eq!(stats.max.load(Ordering::SeqCst), 3);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn each_job_name_has_its_own_limit() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("pdfGeneration").await.unwrap();
    let slow = tracked_worker(&queue, "generateDocument", 1, Duration::from_millis(300));
    let fast = tracked_worker(&queue, "generateThumbnail", 2, Duration::from_millis(20));

    queue.enqueue("generateDocument", &json!({}), None).await.unwrap();
    for _ in 0..4 {
        queue.enqueue("generateThumbnail", &json!({}), None).await.unwrap();
    }

    // thumbnails are not stuck behind the slow document render
    assert!(wait_done(&fast, 4).await);
    assert_eq!(slow.done.load(Ordering::SeqCst), 0);
    assert!(wait_done(&slow, 1).await);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn replaced_handler_shares_the_limit_with_jobs_still_running() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("imports").await.unwrap();
    let stats = tracked_worker(&queue, "processCsv", 1, Duration::from_millis(300));

    queue.enqueue("processCsv", &json!({"file": "a.csv"}), None).await.unwrap();
    let s = stats.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let s = s.clone();
            async move { s.now.load(Ordering::SeqCst) == 1 }
        })
        .await
    );

    register_tracked(&queue, "processCsv", 1, Duration::from_millis(50), stats.clone());
    for i in 0..3 {
        queue
            .enqueue("processCsv", &json!({"file": format!("b-{i}.csv")}), None)
            .await
            .unwrap();
    }

    assert!(wait_done(&stats, 4).await);
    assert_eq!(stats.max.load(Ordering::SeqCst), 1);
    assert_eq!(queue.registered_workers(), vec!["processCsv".to_string()]);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn replaced_handler_can_raise_the_limit() {
    let (_broker, registry) = memory_registry();
    let queue = registry.create_queue::<Value>("email").await.unwrap();
    let stats = tracked_worker(&queue, "sendNotification", 1, Duration::from_millis(80));
    register_tracked(&queue, "sendNotification", 3, Duration::from_millis(80), stats.clone());

    for _ in 0..6 {
        queue.enqueue("sendNotification", &json!({}), None).await.unwrap();
    }

    assert!(wait_done(&stats, 6).await);
    assert_eq!(stats.max.load(Ordering::SeqCst), 3);

    registry.shutdown_all().await;
}
