use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::Broker;
use crate::error::{JobError, QueueResult};
use crate::jobs::{EnqueueOptions, JobId, JobRecord, JobState, Retention};
use crate::queue::JobQueue;

/// Write-once record of a job that used up its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub original_job_id: JobId,
    pub original_queue_name: String,
    pub original_payload: Value,
    pub failure_reason: String,
    pub failure_stack: Option<String>,
    pub failure_timestamp: DateTime<Utc>,
    pub attempts_made: u32,
}

impl DeadLetterEntry {
    pub fn from_failure(job: &JobRecord, error: &JobError) -> Self {
        Self {
            original_job_id: job.id,
            original_queue_name: job.queue.clone(),
            original_payload: job.payload.clone(),
            failure_reason: error.message.clone(),
            failure_stack: error.stack.clone().or_else(|| job.stacktrace.clone()),
            failure_timestamp: Utc::now(),
            attempts_made: job.attempts_made,
        }
    }
}

/// Forwards permanently failed jobs into the shared dead-letter queue.
#[derive(Clone)]
pub struct DeadLetterPolicy {
    dlq: JobQueue<DeadLetterEntry>,
}

impl DeadLetterPolicy {
    pub fn new(dlq: JobQueue<DeadLetterEntry>) -> Self {
        Self { dlq }
    }

    pub fn dlq(&self) -> &JobQueue<DeadLetterEntry> {
        &self.dlq
    }

    /// A failure is final once the job is failed and the attempts pinned on it
    /// at enqueue time are used up.
    pub fn is_exhausted(job: &JobRecord) -> bool {
        job.state == JobState::Failed && job.attempts_exhausted()
    }

    /// Options for DLQ writes: no retries and pruned right away once handled.
    pub fn entry_options() -> EnqueueOptions {
        EnqueueOptions::new()
            .attempts(1)
            .delay(Duration::ZERO)
            .remove_on_complete(Retention::RemoveImmediately)
            .remove_on_fail(Retention::RemoveImmediately)
    }

    /// Handle one failure event. Writes a DLQ entry when the job is exhausted;
    /// a failed DLQ write is logged and dropped. Returns whether an entry was written.
    pub async fn on_failed(&self, job: &JobRecord, error: &JobError) -> bool {
        if !Self::is_exhausted(job) {
            return false;
        }

        let entry = DeadLetterEntry::from_failure(job, error);
        match self
            .dlq
            .enqueue(&job.name, &entry, Some(Self::entry_options()))
            .await
        {
            Ok(handle) => {
                tracing::warn!(
                    queue = %job.queue,
                    job_id = job.id,
                    job_name = %job.name,
                    attempts_made = job.attempts_made,
                    dlq = %self.dlq.name(),
                    dlq_job_id = handle.id,
                    "job moved to dead-letter queue"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    queue = %job.queue,
                    job_id = job.id,
                    job_name = %job.name,
                    dlq = %self.dlq.name(),
                    original_error = %error,
                    error = %e,
                    "failed to write dead-letter entry"
                );
                false
            }
        }
    }

    /// Register this policy as a failure callback on `queue`.
    pub fn attach<T>(&self, queue: &JobQueue<T>)
    where
        T: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        let policy = self.clone();
        queue.on_failed(move |job, err| {
            let policy = policy.clone();
            async move {
                policy.on_failed(&job, &err).await;
            }
        });
    }
}

/// Stored entries of the dead-letter queue `queue`, newest first.
///
/// Nothing consumes a DLQ, so entries stay waiting; a paused DLQ reports them
/// as paused instead.
pub async fn pending_entries(
    broker: &dyn Broker,
    queue: &str,
    limit: usize,
) -> QueueResult<Vec<JobRecord>> {
    let mut jobs = broker.list(queue, JobState::Waiting, limit).await?;
    jobs.extend(broker.list(queue, JobState::Paused, limit).await?);
    jobs.sort_by(|a, b| b.id.cmp(&a.id));
    jobs.truncate(limit);
    Ok(jobs)
}
