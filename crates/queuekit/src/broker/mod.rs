pub mod memory;
pub mod postgres;

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueResult;
use crate::jobs::{JobCounts, JobId, JobOptions, JobRecord, JobState, NewJob};

pub use memory::MemoryBroker;
pub use postgres::PgBroker;

/// Storage and delivery primitives behind every [`JobQueue`](crate::queue::JobQueue).
///
/// A broker owns durability, claiming, locks and native retry scheduling.
/// All methods are keyed by queue name so a single broker (one connection
/// pool) serves every queue in the process.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably store a new job. Returns once the write is acknowledged.
    async fn add(&self, queue: &str, job: NewJob) -> QueueResult<JobRecord>;

    /// Claim the oldest runnable job named `job_name`, locking it under `token`
    /// for `lock`. Returns `None` when nothing is runnable or the queue is paused.
    async fn claim(
        &self,
        queue: &str,
        job_name: &str,
        token: Uuid,
        lock: Duration,
    ) -> QueueResult<Option<JobRecord>>;

    /// Push the lock expiry forward. `false` means the lock was lost.
    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        token: Uuid,
        lock: Duration,
    ) -> QueueResult<bool>;

    /// Mark an active job completed. `None` means the caller no longer held the lock.
    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        token: Uuid,
        result: Value,
    ) -> QueueResult<Option<JobRecord>>;

    /// Record a failed attempt. The broker either reschedules the job after its
    /// backoff delay (state `waiting`, future `run_at`) or moves it to `failed`
    /// once the attempts pinned on the job are used up.
    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        token: Uuid,
        reason: &str,
        stack: Option<&str>,
    ) -> QueueResult<Option<JobRecord>>;

    /// Find active jobs whose lock lapsed. With `force_reason` set each one goes
    /// through the failure pathway with that reason; otherwise it is moved back
    /// to waiting until it has stalled more than `max_stalled_count` times.
    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
        force_reason: Option<&str>,
    ) -> QueueResult<Vec<StalledJob>>;

    async fn get(&self, queue: &str, id: JobId) -> QueueResult<Option<JobRecord>>;

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts>;

    async fn active_count(&self, queue: &str) -> QueueResult<u64>;

    /// Most recent jobs in `state`, newest first.
    async fn list(&self, queue: &str, state: JobState, limit: usize)
        -> QueueResult<Vec<JobRecord>>;

    async fn update_progress(&self, queue: &str, id: JobId, progress: u8) -> QueueResult<bool>;

    async fn pause(&self, queue: &str) -> QueueResult<()>;

    async fn resume(&self, queue: &str) -> QueueResult<()>;

    async fn is_paused(&self, queue: &str) -> QueueResult<bool>;

    /// Discard every waiting and delayed job. Returns how many were removed.
    async fn clear(&self, queue: &str) -> QueueResult<u64>;

    async fn ping(&self) -> QueueResult<()>;

    async fn close(&self) -> QueueResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallResolution {
    /// Moved back to waiting without consuming an attempt.
    Requeued,
    /// Sent through the failure pathway (retry scheduled or terminal).
    Failed,
}

#[derive(Debug, Clone)]
pub struct StalledJob {
    /// The job after recovery was applied.
    pub record: JobRecord,
    pub resolution: StallResolution,
}

pub(crate) const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

/// State reported for a stored job. Pending jobs are `delayed` until their
/// `run_at`, and `paused` while their queue is paused.
pub(crate) fn visible_state(
    stored: JobState,
    run_at: DateTime<Utc>,
    now: DateTime<Utc>,
    paused: bool,
) -> JobState {
    match stored {
        JobState::Waiting if run_at > now => JobState::Delayed,
        JobState::Waiting if paused => JobState::Paused,
        other => other,
    }
}

/// Outcome of one more failed attempt: the stored state and next `run_at`.
pub(crate) fn after_failure(
    attempts_made: u32,
    options: &JobOptions,
    now: DateTime<Utc>,
) -> (JobState, DateTime<Utc>) {
    if attempts_made < options.attempts {
        let delay = options.backoff.delay_for(attempts_made);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        (JobState::Waiting, now + delay)
    } else {
        (JobState::Failed, now)
    }
}

pub(crate) fn chrono_duration(dur: Duration) -> chrono::Duration {
    chrono::Duration::from_std(dur).unwrap_or(chrono::Duration::MAX)
}

/// Shared, reference-counted access to one broker connection.
///
/// Every queue takes a [`BrokerLease`]; the connection is closed when the last
/// lease is released.
#[derive(Clone)]
pub struct BrokerHandle {
    broker: Arc<dyn Broker>,
    leases: Arc<AtomicUsize>,
}

impl BrokerHandle {
    pub fn new(broker: impl Broker + 'static) -> Self {
        Self::from_arc(Arc::new(broker))
    }

    pub fn from_arc(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            leases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn lease(&self) -> BrokerLease {
        self.leases.fetch_add(1, Ordering::SeqCst);
        BrokerLease {
            broker: self.broker.clone(),
            leases: self.leases.clone(),
            released: AtomicBool::new(false),
        }
    }

    pub fn open_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }
}

pub struct BrokerLease {
    broker: Arc<dyn Broker>,
    leases: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl BrokerLease {
    /// Give the lease back. Returns `true` when this was the last lease and the
    /// broker connection was closed. Releasing twice is a no-op.
    pub async fn release(&self) -> QueueResult<bool> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        if self.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.broker.close().await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Owned pointer for background tasks; does not count as a lease.
    pub fn shared(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }
}

impl Deref for BrokerLease {
    type Target = dyn Broker;

    fn deref(&self) -> &Self::Target {
        self.broker.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Backoff;

    #[test]
    fn pending_job_state_is_derived() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);

        assert_eq!(
            visible_state(JobState::Waiting, later, now, false),
            JobState::Delayed
        );
        assert_eq!(
            visible_state(JobState::Waiting, now, now, true),
            JobState::Paused
        );
        assert_eq!(
            visible_state(JobState::Waiting, now, now, false),
            JobState::Waiting
        );
        assert_eq!(
            visible_state(JobState::Active, later, now, true),
            JobState::Active
        );
    }

    #[test]
    fn failure_reschedules_until_attempts_run_out() {
        let now = Utc::now();
        let opts = JobOptions {
            attempts: 2,
            backoff: Backoff::fixed(Duration::from_secs(10)),
            ..JobOptions::default()
        };

        let (state, run_at) = after_failure(1, &opts, now);
        assert_eq!(state, JobState::Waiting);
        assert_eq!(run_at, now + chrono::Duration::seconds(10));

        let (state, _) = after_failure(2, &opts, now);
        assert_eq!(state, JobState::Failed);
    }

    #[tokio::test]
    async fn last_lease_closes_the_broker() {
        let handle = BrokerHandle::new(MemoryBroker::new());
        let a = handle.lease();
        let b = handle.lease();
        assert_eq!(handle.open_leases(), 2);

        assert!(!a.release().await.unwrap());
        assert!(!a.release().await.unwrap(), "double release is a no-op");
        assert!(handle.broker().ping().await.is_ok());

        assert!(b.release().await.unwrap());
        assert!(handle.broker().ping().await.is_err());
    }
}
