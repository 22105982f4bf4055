pub mod events;
mod worker;

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::broker::{BrokerHandle, BrokerLease};
use crate::error::{JobError, QueueError, QueueResult};
use crate::jobs::{
    EnqueueOptions, Job, JobCounts, JobHandle, JobId, JobOptions, JobRecord, JobState,
    JobStatusSummary, NewJob,
};
use crate::policy::StalledJobReaper;
use crate::shutdown::{DrainConfig, DrainReport, DrainTarget, GracefulShutdownCoordinator};

pub use events::QueueEvents;
use worker::{HandlerEntry, WorkerLoop};

/// Per-queue runtime settings shared by every queue a registry creates.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// How long a claimed job stays locked before its worker is presumed dead.
    pub lock_duration: Duration,
    pub lock_renew_time: Duration,
    pub stalled_interval: Duration,
    /// High on purpose: stalls are forced to failures, not requeued.
    pub max_stalled_count: u32,
    /// Idle sleep between claim attempts when nothing is runnable.
    pub poll_interval: Duration,
    pub drain: DrainConfig,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let lock_duration = Duration::from_secs(3600);
        Self {
            lock_duration,
            lock_renew_time: lock_duration / 2,
            stalled_interval: Duration::from_secs(300),
            max_stalled_count: 1000,
            poll_interval: Duration::from_millis(250),
            drain: DrainConfig::default(),
        }
    }
}

pub(crate) struct QueueInner {
    pub name: String,
    pub broker: BrokerLease,
    pub defaults: JobOptions,
    pub settings: QueueSettings,
    pub events: Arc<QueueEvents>,
    pub local_pause: watch::Sender<bool>,
    workers: Mutex<HashMap<String, WorkerLoop>>,
    tasks: Mutex<JoinSet<()>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    closed: AtomicBool,
}

impl QueueInner {
    pub fn track<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().spawn(fut);
    }

    pub fn reap_finished(&self) {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
    }

    /// Handler tasks still running here, result bookkeeping and listeners included.
    pub fn in_flight(&self) -> u64 {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len() as u64
    }
}

/// A named, broker-backed job queue whose payloads are `T`.
///
/// Cloning is cheap; clones share workers, listeners and the broker lease.
pub struct JobQueue<T> {
    inner: Arc<QueueInner>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> JobQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open the queue on a lease of `broker`, resume it if a previous process
    /// left it paused, and start the stalled-job reaper.
    pub async fn open(
        name: &str,
        broker: &BrokerHandle,
        settings: QueueSettings,
        defaults: JobOptions,
    ) -> QueueResult<Self> {
        let lease = broker.lease();
        if let Err(e) = auto_resume(&lease, name).await {
            let _ = lease.release().await;
            return Err(e);
        }

        let events = Arc::new(QueueEvents::default());
        events.attach_logging(name);

        let reaper = StalledJobReaper::new(
            name,
            lease.shared(),
            events.clone(),
            settings.max_stalled_count,
            settings.stalled_interval,
        )
        .spawn();

        let (local_pause, _) = watch::channel(false);
        let inner = QueueInner {
            name: name.to_string(),
            broker: lease,
            defaults,
            settings,
            events,
            local_pause,
            workers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            reaper: Mutex::new(Some(reaper)),
            shutting_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        tracing::info!(queue = %name, "queue opened");
        Ok(Self {
            inner: Arc::new(inner),
            _payload: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.inner.defaults
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Durably store a job. Returns once the broker acknowledged the write.
    pub async fn enqueue(
        &self,
        job_name: &str,
        payload: &T,
        options: Option<EnqueueOptions>,
    ) -> QueueResult<JobHandle> {
        if job_name.trim().is_empty() {
            return Err(QueueError::InvalidJobName);
        }
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let options = options.unwrap_or_default().resolve(&self.inner.defaults);
        let job = NewJob {
            name: job_name.to_string(),
            payload: serde_json::to_value(payload)?,
            options,
        };
        let record = self.inner.broker.add(&self.inner.name, job).await?;

        tracing::debug!(
            queue = %self.inner.name,
            job_id = record.id,
            job_name = %record.name,
            attempts = record.options.attempts,
            delay_ms = record.options.delay.as_millis() as u64,
            "job enqueued"
        );

        Ok(JobHandle {
            id: record.id,
            queue: record.queue,
            name: record.name,
        })
    }

    /// Start pulling jobs named `job_name`, running at most `concurrency`
    /// handler invocations at once in this process.
    ///
    /// Registering the same name again replaces the previous handler: its
    /// claim loop stops (jobs it already started run to completion) and a
    /// warning is logged. The limit carries over, so jobs still running under
    /// the old handler count against the new one.
    pub fn register_worker<F, Fut, R>(&self, job_name: &str, concurrency: usize, handler: F)
    where
        F: Fn(Job<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JobError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        if self.is_closed() {
            tracing::warn!(queue = %self.inner.name, job_name, "ignoring worker registration on closed queue");
            return;
        }

        let previous = {
            let mut workers = self.inner.workers.lock();
            let previous = workers.remove(job_name);
            let mut entry = HandlerEntry::new(job_name, concurrency, handler);
            if let Some(previous) = &previous {
                entry = entry.replacing(previous);
            }
            let running = worker::spawn_loop(self.inner.clone(), Arc::new(entry));
            workers.insert(job_name.to_string(), running);
            previous
        };

        if let Some(previous) = previous {
            previous.stop();
            tracing::warn!(
                queue = %self.inner.name,
                job_name,
                "handler registered twice; the previous registration was replaced"
            );
        }
        tracing::info!(queue = %self.inner.name, job_name, concurrency, "worker registered");
    }

    pub fn registered_workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.workers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn get_job_counts(&self) -> QueueResult<JobCounts> {
        self.inner.broker.counts(&self.inner.name).await
    }

    pub async fn get_active_count(&self) -> QueueResult<u64> {
        self.inner.broker.active_count(&self.inner.name).await
    }

    pub async fn get_job(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        self.inner.broker.get(&self.inner.name, id).await
    }

    /// Typed view of a stored job; fails if the payload no longer decodes as `T`.
    pub async fn get_typed_job(&self, id: JobId) -> QueueResult<Option<Job<T>>> {
        match self.get_job(id).await? {
            Some(record) => Ok(Some(Job::from_record(&record)?)),
            None => Ok(None),
        }
    }

    pub async fn get_job_status(&self, id: JobId) -> QueueResult<JobStatusSummary> {
        Ok(match self.get_job(id).await? {
            Some(record) => JobStatusSummary::from_record(&record),
            None => JobStatusSummary::missing(),
        })
    }

    pub async fn list_jobs(&self, state: JobState, limit: usize) -> QueueResult<Vec<JobRecord>> {
        self.inner.broker.list(&self.inner.name, state, limit).await
    }

    /// Record handler progress, clamped to 0..=100.
    pub async fn update_progress(&self, id: JobId, progress: u8) -> QueueResult<()> {
        let updated = self
            .inner
            .broker
            .update_progress(&self.inner.name, id, progress.min(100))
            .await?;
        if !updated {
            return Err(QueueError::NotFound {
                queue: self.inner.name.clone(),
                id,
            });
        }
        Ok(())
    }

    /// Stop new claims on this queue for every process. In-flight jobs continue.
    pub async fn pause(&self) -> QueueResult<()> {
        self.inner.broker.pause(&self.inner.name).await?;
        tracing::info!(queue = %self.inner.name, "queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> QueueResult<()> {
        self.inner.broker.resume(&self.inner.name).await?;
        self.inner.local_pause.send_replace(false);
        tracing::info!(queue = %self.inner.name, "queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        self.inner.broker.is_paused(&self.inner.name).await
    }

    /// Discard every waiting and delayed job.
    pub async fn clear(&self) -> QueueResult<u64> {
        let removed = self.inner.broker.clear(&self.inner.name).await?;
        tracing::warn!(queue = %self.inner.name, removed, "queue cleared");
        Ok(removed)
    }

    /// Stop this process's claim loops without touching the shared pause flag.
    pub fn pause_local(&self) {
        self.inner.local_pause.send_replace(true);
    }

    pub fn resume_local(&self) {
        self.inner.local_pause.send_replace(false);
    }

    pub fn on_completed<F, Fut>(&self, f: F)
    where
        F: Fn(JobRecord, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.events.on_completed(f);
    }

    pub fn on_failed<F, Fut>(&self, f: F)
    where
        F: Fn(JobRecord, JobError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.events.on_failed(f);
    }

    pub fn on_stalled<F, Fut>(&self, f: F)
    where
        F: Fn(JobId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.events.on_stalled(f);
    }

    pub fn on_error<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<QueueError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.events.on_error(f);
    }

    pub fn remove_all_listeners(&self) {
        self.inner.events.remove_all_listeners();
    }

    pub fn listener_count(&self) -> usize {
        self.inner.events.listener_count()
    }

    /// Run one stalled-job sweep now instead of waiting for the interval.
    pub async fn check_stalled(&self) -> QueueResult<usize> {
        StalledJobReaper::new(
            &self.inner.name,
            self.inner.broker.shared(),
            self.inner.events.clone(),
            self.inner.settings.max_stalled_count,
            self.inner.settings.stalled_interval,
        )
        .reap()
        .await
    }

    /// Drain and close with this queue's [`DrainConfig`]. Never fails; errors
    /// are logged and reported.
    pub async fn shutdown(&self) -> DrainReport {
        GracefulShutdownCoordinator::new(self.inner.settings.drain.clone())
            .shutdown(self)
            .await
    }

    /// Stop workers and the reaper, abort in-flight handlers and release the
    /// broker lease. Idempotent.
    pub async fn close(&self) -> QueueResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let workers: Vec<WorkerLoop> = self.inner.workers.lock().drain().map(|(_, w)| w).collect();
        for w in workers {
            w.stop();
            w.task.abort();
        }
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        tasks.shutdown().await;

        let closed_connection = self.inner.broker.release().await?;
        tracing::debug!(queue = %self.inner.name, closed_connection, "queue closed");
        Ok(())
    }
}

#[async_trait]
impl<T> DrainTarget for JobQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn queue_name(&self) -> &str {
        self.name()
    }

    fn begin_shutdown(&self) -> bool {
        !self.inner.shutting_down.swap(true, Ordering::SeqCst)
    }

    fn stop_claiming(&self) {
        self.pause_local();
    }

    async fn active_jobs(&self) -> QueueResult<u64> {
        // a failed job leaves `active` before its listeners (dead-lettering
        // among them) have finished
        let stored = self.get_active_count().await?;
        Ok(stored.max(self.inner.in_flight()))
    }

    fn detach_listeners(&self) {
        self.remove_all_listeners();
    }

    async fn close(&self) -> QueueResult<()> {
        JobQueue::close(self).await
    }
}

async fn auto_resume(broker: &BrokerLease, queue: &str) -> QueueResult<()> {
    if broker.is_paused(queue).await? {
        broker.resume(queue).await?;
        tracing::warn!(queue = %queue, "queue was left paused by a previous process; resumed");
    }
    Ok(())
}
