use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use super::{
    after_failure, chrono_duration, visible_state, Broker, StallResolution, StalledJob,
    STALLED_LIMIT_REASON,
};
use crate::error::{QueueError, QueueResult};
use crate::jobs::{JobCounts, JobId, JobRecord, JobState, NewJob, Retention};

/// In-process broker with the same semantics as [`PgBroker`](super::PgBroker).
///
/// Nothing survives the process; use it for development and tests. Clones
/// share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueStore>>,
    next_id: AtomicI64,
    closed: AtomicBool,
}

#[derive(Default)]
struct QueueStore {
    jobs: BTreeMap<JobId, StoredJob>,
    paused: bool,
    reject_adds: Option<String>,
}

struct StoredJob {
    record: JobRecord,
    lock_token: Option<Uuid>,
    lock_expires_at: Option<DateTime<Utc>>,
    stalled_count: u32,
}

impl StoredJob {
    fn view(&self, now: DateTime<Utc>, paused: bool) -> JobRecord {
        let mut record = self.record.clone();
        record.state = visible_state(record.state, record.run_at, now, paused);
        record
    }

    fn holds_lock(&self, token: Uuid) -> bool {
        self.record.state == JobState::Active && self.lock_token == Some(token)
    }

    fn clear_lock(&mut self) {
        self.lock_token = None;
        self.lock_expires_at = None;
    }

    fn apply_failure(&mut self, reason: &str, stack: Option<&str>, now: DateTime<Utc>) {
        self.clear_lock();
        self.record.attempts_made += 1;
        self.record.failed_reason = Some(reason.to_string());
        self.record.stacktrace = stack.map(str::to_string);

        let (state, run_at) = after_failure(self.record.attempts_made, &self.record.options, now);
        self.record.state = state;
        if state == JobState::Failed {
            self.record.finished_at = Some(now);
        } else {
            self.record.run_at = run_at;
        }
    }
}

impl QueueStore {
    /// Drop the oldest finished jobs in `state` beyond what `retention` keeps.
    fn prune(&mut self, state: JobState, retention: Retention) {
        let Some(keep) = retention.keep() else {
            return;
        };

        let mut finished: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .values()
            .filter(|j| j.record.state == state)
            .map(|j| (j.record.finished_at.unwrap_or(j.record.created_at), j.record.id))
            .collect();

        if finished.len() <= keep {
            return;
        }

        // newest first; everything after `keep` goes
        finished.sort_by(|a, b| b.cmp(a));
        for (_, id) in finished.into_iter().skip(keep) {
            self.jobs.remove(&id);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueStore) -> R) -> QueueResult<R> {
        self.ensure_open()?;
        let mut queues = self.inner.queues.lock();
        let store = queues.entry(queue.to_string()).or_default();
        Ok(f(store))
    }

    // ----------------------------
    // Test hooks
    // ----------------------------

    /// Make every following `add` to `queue` fail as if the broker refused the write.
    pub fn reject_adds(&self, queue: &str, reason: &str) {
        let mut queues = self.inner.queues.lock();
        queues.entry(queue.to_string()).or_default().reject_adds = Some(reason.to_string());
    }

    pub fn accept_adds(&self, queue: &str) {
        let mut queues = self.inner.queues.lock();
        if let Some(store) = queues.get_mut(queue) {
            store.reject_adds = None;
        }
    }

    /// Backdate the lock of an active job so the next stalled check picks it up.
    pub fn expire_lock(&self, queue: &str, id: JobId) -> bool {
        let mut queues = self.inner.queues.lock();
        let Some(job) = queues.get_mut(queue).and_then(|s| s.jobs.get_mut(&id)) else {
            return false;
        };
        if job.record.state != JobState::Active {
            return false;
        }
        job.lock_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn add(&self, queue: &str, job: NewJob) -> QueueResult<JobRecord> {
        let now = Utc::now();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        self.with_queue(queue, |store| {
            if let Some(reason) = &store.reject_adds {
                return Err(QueueError::Rejected {
                    queue: queue.to_string(),
                    reason: reason.clone(),
                });
            }

            let record = JobRecord {
                id,
                queue: queue.to_string(),
                name: job.name,
                payload: job.payload,
                state: JobState::Waiting,
                attempts_made: 0,
                run_at: now + chrono_duration(job.options.delay),
                options: job.options,
                progress: 0,
                return_value: None,
                failed_reason: None,
                stacktrace: None,
                created_at: now,
                processed_at: None,
                finished_at: None,
            };

            let view = StoredJob {
                record,
                lock_token: None,
                lock_expires_at: None,
                stalled_count: 0,
            };
            let out = view.view(now, store.paused);
            store.jobs.insert(id, view);
            Ok(out)
        })?
    }

    async fn claim(
        &self,
        queue: &str,
        job_name: &str,
        token: Uuid,
        lock: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        let now = Utc::now();
        self.with_queue(queue, |store| {
            if store.paused {
                return None;
            }

            let candidate = store
                .jobs
                .values()
                .filter(|j| {
                    j.record.state == JobState::Waiting
                        && j.record.name == job_name
                        && j.record.run_at <= now
                })
                .min_by_key(|j| (j.record.run_at, j.record.id))
                .map(|j| j.record.id)?;

            let job = store.jobs.get_mut(&candidate)?;
            job.record.state = JobState::Active;
            job.record.processed_at = Some(now);
            job.lock_token = Some(token);
            job.lock_expires_at = Some(now + chrono_duration(lock));
            Some(job.record.clone())
        })
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        token: Uuid,
        lock: Duration,
    ) -> QueueResult<bool> {
        let now = Utc::now();
        self.with_queue(queue, |store| match store.jobs.get_mut(&id) {
            Some(job) if job.holds_lock(token) => {
                job.lock_expires_at = Some(now + chrono_duration(lock));
                true
            }
            _ => false,
        })
    }

    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        token: Uuid,
        result: Value,
    ) -> QueueResult<Option<JobRecord>> {
        let now = Utc::now();
        self.with_queue(queue, |store| {
            let job = store.jobs.get_mut(&id).filter(|j| j.holds_lock(token))?;
            job.clear_lock();
            job.record.state = JobState::Completed;
            job.record.finished_at = Some(now);
            job.record.return_value = Some(result);

            let out = job.record.clone();
            store.prune(JobState::Completed, out.options.remove_on_complete);
            Some(out)
        })
    }

    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        token: Uuid,
        reason: &str,
        stack: Option<&str>,
    ) -> QueueResult<Option<JobRecord>> {
        let now = Utc::now();
        self.with_queue(queue, |store| {
            let paused = store.paused;
            let job = store.jobs.get_mut(&id).filter(|j| j.holds_lock(token))?;
            job.apply_failure(reason, stack, now);

            let out = job.view(now, paused);
            if out.state == JobState::Failed {
                store.prune(JobState::Failed, out.options.remove_on_fail);
            }
            Some(out)
        })
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
        force_reason: Option<&str>,
    ) -> QueueResult<Vec<StalledJob>> {
        let now = Utc::now();
        self.with_queue(queue, |store| {
            let paused = store.paused;
            let mut out = Vec::new();

            for job in store.jobs.values_mut() {
                let lapsed = job.record.state == JobState::Active
                    && job.lock_expires_at.map(|t| t < now).unwrap_or(false);
                if !lapsed {
                    continue;
                }

                job.stalled_count += 1;
                let resolution = match force_reason {
                    Some(reason) => {
                        job.apply_failure(reason, None, now);
                        StallResolution::Failed
                    }
                    None if job.stalled_count > max_stalled_count => {
                        job.apply_failure(STALLED_LIMIT_REASON, None, now);
                        StallResolution::Failed
                    }
                    None => {
                        job.clear_lock();
                        job.record.state = JobState::Waiting;
                        job.record.run_at = now;
                        StallResolution::Requeued
                    }
                };

                out.push(StalledJob {
                    record: job.view(now, paused),
                    resolution,
                });
            }

            let failed_retention = out
                .iter()
                .filter(|s| s.record.state == JobState::Failed)
                .map(|s| s.record.options.remove_on_fail)
                .last();
            if let Some(retention) = failed_retention {
                store.prune(JobState::Failed, retention);
            }

            out
        })
    }

    async fn get(&self, queue: &str, id: JobId) -> QueueResult<Option<JobRecord>> {
        let now = Utc::now();
        self.with_queue(queue, |store| {
            store.jobs.get(&id).map(|j| j.view(now, store.paused))
        })
    }

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        let now = Utc::now();
        self.with_queue(queue, |store| {
            let mut counts = JobCounts::default();
            for job in store.jobs.values() {
                counts.bump(visible_state(
                    job.record.state,
                    job.record.run_at,
                    now,
                    store.paused,
                ));
            }
            counts
        })
    }

    async fn active_count(&self, queue: &str) -> QueueResult<u64> {
        self.with_queue(queue, |store| {
            store
                .jobs
                .values()
                .filter(|j| j.record.state == JobState::Active)
                .count() as u64
        })
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        let now = Utc::now();
        self.with_queue(queue, |store| {
            store
                .jobs
                .values()
                .rev()
                .map(|j| j.view(now, store.paused))
                .filter(|r| r.state == state)
                .take(limit)
                .collect()
        })
    }

    async fn update_progress(&self, queue: &str, id: JobId, progress: u8) -> QueueResult<bool> {
        self.with_queue(queue, |store| match store.jobs.get_mut(&id) {
            Some(job) => {
                job.record.progress = progress.min(100);
                true
            }
            None => false,
        })
    }

    async fn pause(&self, queue: &str) -> QueueResult<()> {
        self.with_queue(queue, |store| store.paused = true)
    }

    async fn resume(&self, queue: &str) -> QueueResult<()> {
        self.with_queue(queue, |store| store.paused = false)
    }

    async fn is_paused(&self, queue: &str) -> QueueResult<bool> {
        self.with_queue(queue, |store| store.paused)
    }

    async fn clear(&self, queue: &str) -> QueueResult<u64> {
        self.with_queue(queue, |store| {
            let before = store.jobs.len();
            store.jobs.retain(|_, j| j.record.state != JobState::Waiting);
            (before - store.jobs.len()) as u64
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        self.ensure_open()
    }

    async fn close(&self) -> QueueResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
