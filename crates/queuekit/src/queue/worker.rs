use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use super::events::BoxFuture;
use super::QueueInner;
use crate::error::JobError;
use crate::jobs::{Job, JobRecord};

type HandlerFn<T> = dyn Fn(Job<T>) -> BoxFuture<Result<Value, JobError>> + Send + Sync;

/// One registered handler for a job name, with its concurrency bound.
pub(crate) struct HandlerEntry<T> {
    pub job_name: String,
    pub handler: Arc<HandlerFn<T>>,
    pub semaphore: Arc<Semaphore>,
    pub concurrency: usize,
    _payload: PhantomData<fn() -> T>,
}

impl<T> HandlerEntry<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new<F, Fut, R>(job_name: &str, concurrency: usize, handler: F) -> Self
    where
        F: Fn(Job<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JobError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Arc<HandlerFn<T>> = Arc::new(move |job: Job<T>| {
            let fut = handler(job);
            Box::pin(async move {
                let out = fut.await?;
                serde_json::to_value(out)
                    .map_err(|e| JobError::new(format!("unserializable job result: {e}")))
            }) as BoxFuture<Result<Value, JobError>>
        });
        let concurrency = concurrency.max(1);
        Self {
            job_name: job_name.to_string(),
            handler: erased,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            _payload: PhantomData,
        }
    }

    /// Take over the permits of a replaced registration so its in-flight jobs
    /// keep counting against the limit, resized to this entry's concurrency.
    pub fn replacing(mut self, previous: &WorkerLoop) -> Self {
        let semaphore = previous.semaphore.clone();
        if self.concurrency > previous.concurrency {
            semaphore.add_permits(self.concurrency - previous.concurrency);
        } else if self.concurrency < previous.concurrency {
            let surplus = (previous.concurrency - self.concurrency) as u32;
            let shrink = semaphore.clone();
            // busy permits are retired as the old jobs hand them back
            tokio::spawn(async move {
                if let Ok(permits) = shrink.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }
        self.semaphore = semaphore;
        self
    }

    /// Decode the payload and run the handler under the job's timeout.
    pub async fn run(&self, record: &JobRecord) -> Result<Value, JobError> {
        let job = Job::<T>::from_record(record)?;
        let limit = record.options.timeout;
        match timeout(limit, (self.handler)(job)).await {
            Ok(inner) => inner,
            Err(_) => Err(JobError::new(format!(
                "job timed out after {} ms",
                limit.as_millis()
            ))),
        }
    }
}

/// A running claim loop; dropping the handle does not stop it.
pub(crate) struct WorkerLoop {
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<()>,
    pub semaphore: Arc<Semaphore>,
    pub concurrency: usize,
}

impl WorkerLoop {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

pub(crate) fn spawn_loop<T>(inner: Arc<QueueInner>, entry: Arc<HandlerEntry<T>>) -> WorkerLoop
where
    T: DeserializeOwned + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let semaphore = entry.semaphore.clone();
    let concurrency = entry.concurrency;
    let task = tokio::spawn(claim_loop(inner, entry, stop_rx));
    WorkerLoop {
        stop: stop_tx,
        task,
        semaphore,
        concurrency,
    }
}

async fn claim_loop<T>(
    inner: Arc<QueueInner>,
    entry: Arc<HandlerEntry<T>>,
    mut stop: watch::Receiver<bool>,
) where
    T: DeserializeOwned + Send + 'static,
{
    let mut paused = inner.local_pause.subscribe();
    let poll = inner.settings.poll_interval;

    loop {
        inner.reap_finished();

        if *stop.borrow() {
            break;
        }
        if *paused.borrow() {
            tokio::select! {
                _ = paused.changed() => continue,
                _ = stop.changed() => break,
            }
        }

        let permit = tokio::select! {
            p = entry.semaphore.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = stop.changed() => break,
        };
        // re-check: the queue may have been paused while we waited for a slot
        if *paused.borrow() || *stop.borrow() {
            continue;
        }

        let token = Uuid::new_v4();
        let claimed = inner
            .broker
            .claim(&inner.name, &entry.job_name, token, inner.settings.lock_duration)
            .await;

        match claimed {
            Ok(Some(record)) => {
                tracing::debug!(
                    queue = %inner.name,
                    job_id = record.id,
                    job_name = %record.name,
                    attempts_made = record.attempts_made,
                    "claimed job"
                );
                let task = process(inner.clone(), entry.clone(), record, token, permit);
                inner.track(task);
            }
            Ok(None) => {
                drop(permit);
                if idle(&mut stop, poll).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                inner.events.emit_error(e).await;
                if idle(&mut stop, poll).await {
                    break;
                }
            }
        }
    }

    tracing::debug!(queue = %inner.name, job_name = %entry.job_name, "worker loop stopped");
}

/// Sleep for one poll interval. Returns `true` when asked to stop meanwhile.
async fn idle(stop: &mut watch::Receiver<bool>, poll: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(poll) => false,
        _ = stop.changed() => true,
    }
}

async fn process<T>(
    inner: Arc<QueueInner>,
    entry: Arc<HandlerEntry<T>>,
    record: JobRecord,
    token: Uuid,
    _permit: OwnedSemaphorePermit,
) where
    T: DeserializeOwned + Send + 'static,
{
    let renewer = AbortOnDrop(spawn_lock_renewal(inner.clone(), record.id, token));
    let outcome = match AssertUnwindSafe(entry.run(&record)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(JobError::new(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };
    drop(renewer);

    match outcome {
        Ok(result) => match inner
            .broker
            .complete(&inner.name, record.id, token, result.clone())
            .await
        {
            Ok(Some(done)) => inner.events.emit_completed(&done, &result).await,
            Ok(None) => lock_lost(&inner, &record),
            Err(e) => inner.events.emit_error(e).await,
        },
        Err(err) => match inner
            .broker
            .fail(
                &inner.name,
                record.id,
                token,
                &err.message,
                err.stack.as_deref(),
            )
            .await
        {
            Ok(Some(failed)) => inner.events.emit_failed(&failed, &err).await,
            Ok(None) => lock_lost(&inner, &record),
            Err(e) => inner.events.emit_error(e).await,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Aborts the lock renewal however the attempt ends.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn lock_lost(inner: &QueueInner, record: &JobRecord) {
    tracing::warn!(
        queue = %inner.name,
        job_id = record.id,
        job_name = %record.name,
        "job lock lost before the result was recorded"
    );
}

fn spawn_lock_renewal(inner: Arc<QueueInner>, id: i64, token: Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        let every = inner.settings.lock_renew_time.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(every);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match inner
                .broker
                .extend_lock(&inner.name, id, token, inner.settings.lock_duration)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(queue = %inner.name, job_id = id, "job lock could not be renewed");
                    return;
                }
                Err(e) => inner.events.emit_error(e).await,
            }
        }
    })
}
