use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{JobError, QueueError};
use crate::jobs::{JobId, JobRecord};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type Listener<A> = Arc<dyn Fn(A) -> BoxFuture<()> + Send + Sync>;

/// Explicit callback lists for a queue's lifecycle events.
///
/// Listeners run in registration order and are awaited by the task that
/// raised the event.
#[derive(Default)]
pub struct QueueEvents {
    completed: RwLock<Vec<Listener<(JobRecord, Value)>>>,
    failed: RwLock<Vec<Listener<(JobRecord, JobError)>>>,
    stalled: RwLock<Vec<Listener<JobId>>>,
    error: RwLock<Vec<Listener<Arc<QueueError>>>>,
}

fn boxed<A, F, Fut>(f: F) -> Listener<A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |arg| Box::pin(f(arg)) as BoxFuture<()>)
}

impl QueueEvents {
    pub fn on_completed<F, Fut>(&self, f: F)
    where
        F: Fn(JobRecord, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.completed
            .write()
            .push(boxed(move |(job, result): (JobRecord, Value)| f(job, result)));
    }

    pub fn on_failed<F, Fut>(&self, f: F)
    where
        F: Fn(JobRecord, JobError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.failed
            .write()
            .push(boxed(move |(job, err): (JobRecord, JobError)| f(job, err)));
    }

    pub fn on_stalled<F, Fut>(&self, f: F)
    where
        F: Fn(JobId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stalled.write().push(boxed(f));
    }

    pub fn on_error<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<QueueError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.error.write().push(boxed(f));
    }

    pub fn remove_all_listeners(&self) {
        self.completed.write().clear();
        self.failed.write().clear();
        self.stalled.write().clear();
        self.error.write().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.completed.read().len()
            + self.failed.read().len()
            + self.stalled.read().len()
            + self.error.read().len()
    }

    pub(crate) async fn emit_completed(&self, job: &JobRecord, result: &Value) {
        let listeners = self.completed.read().clone();
        for listener in listeners {
            listener((job.clone(), result.clone())).await;
        }
    }

    pub(crate) async fn emit_failed(&self, job: &JobRecord, err: &JobError) {
        let listeners = self.failed.read().clone();
        for listener in listeners {
            listener((job.clone(), err.clone())).await;
        }
    }

    pub(crate) async fn emit_stalled(&self, id: JobId) {
        let listeners = self.stalled.read().clone();
        for listener in listeners {
            listener(id).await;
        }
    }

    pub(crate) async fn emit_error(&self, err: QueueError) {
        let err = Arc::new(err);
        let listeners = self.error.read().clone();
        for listener in listeners {
            listener(err.clone()).await;
        }
    }

    /// Log lines every queue carries: completion with duration and result
    /// summary, failure with attempt count, stalls, and queue-level errors.
    pub(crate) fn attach_logging(&self, queue: &str) {
        let q = queue.to_string();
        self.on_completed(move |job, result| {
            let queue = q.clone();
            async move {
                let duration_ms = job
                    .processing_duration()
                    .map(|d| d.num_milliseconds())
                    .unwrap_or_default();
                tracing::info!(
                    queue = %queue,
                    job_id = job.id,
                    job_name = %job.name,
                    duration_ms,
                    result = %summarize(&result),
                    "job completed"
                );
            }
        });

        let q = queue.to_string();
        self.on_failed(move |job, err| {
            let queue = q.clone();
            async move {
                tracing::warn!(
                    queue = %queue,
                    job_id = job.id,
                    job_name = %job.name,
                    attempts_made = job.attempts_made,
                    attempts = job.options.attempts,
                    error = %err,
                    "job failed"
                );
            }
        });

        let q = queue.to_string();
        self.on_stalled(move |id| {
            let queue = q.clone();
            async move {
                tracing::warn!(queue = %queue, job_id = id, "job stalled");
            }
        });

        let q = queue.to_string();
        self.on_error(move |err| {
            let queue = q.clone();
            async move {
                tracing::error!(queue = %queue, error = %err, "queue error");
            }
        });
    }
}

const SUMMARY_LIMIT: usize = 200;

/// Short single-line rendering of a handler result for logs.
pub(crate) fn summarize(value: &Value) -> String {
    let text = value.to_string();
    if text.len() <= SUMMARY_LIMIT {
        return text;
    }
    let mut cut = SUMMARY_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn listeners_run_in_registration_order() {
        let events = QueueEvents::default();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            events.on_stalled(move |id| {
                let seen = seen.clone();
                async move { seen.lock().push((tag, id)) }
            });
        }

        events.emit_stalled(7).await;
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[tokio::test]
    async fn removed_listeners_are_not_called() {
        let events = QueueEvents::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        events.on_error(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        events.attach_logging("email");
        assert_eq!(events.listener_count(), 5);

        events.remove_all_listeners();
        events.emit_error(QueueError::Closed).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(events.listener_count(), 0);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn queue_errors_are_logged() {
        let events = QueueEvents::default();
        events.attach_logging("email");

        events.emit_error(QueueError::Closed).await;
        assert!(logs_contain("queue error"));
        assert!(logs_contain("broker closed"));
    }

    #[test]
    fn long_results_are_truncated() {
        let value = Value::String("x".repeat(500));
        let s = summarize(&value);
        assert!(s.ends_with("..."));
        assert_eq!(s.len(), SUMMARY_LIMIT + 3);
        assert_eq!(summarize(&serde_json::json!({"ok": true})), r#"{"ok":true}"#);
    }
}
