use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Delayed,
        JobState::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "delayed" => Some(JobState::Delayed),
            "paused" => Some(JobState::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// How many finished jobs a queue keeps around after completion or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    KeepAll,
    RemoveImmediately,
    KeepLast(u32),
}

impl Retention {
    /// Storage encoding: -1 keep all, 0 remove immediately, n keep last n.
    pub fn to_db(self) -> i32 {
        match self {
            Retention::KeepAll => -1,
            Retention::RemoveImmediately => 0,
            Retention::KeepLast(n) => n.min(i32::MAX as u32) as i32,
        }
    }

    pub fn from_db(value: i32) -> Self {
        match value {
            v if v < 0 => Retention::KeepAll,
            0 => Retention::RemoveImmediately,
            n => Retention::KeepLast(n as u32),
        }
    }

    /// Number of finished jobs to keep, `None` meaning unbounded.
    pub fn keep(self) -> Option<usize> {
        match self {
            Retention::KeepAll => None,
            Retention::RemoveImmediately => Some(0),
            Retention::KeepLast(n) => Some(n as usize),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    /// Delay before the next attempt; fixed backoff ignores the attempt number.
    pub fn delay_for(&self, _attempts_made: u32) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
        }
    }
}

/// Effective options of a job, resolved once at enqueue time and stored with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub timeout: Duration,
    pub backoff: Backoff,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(60),
            backoff: Backoff::fixed(Duration::from_secs(10)),
            remove_on_complete: Retention::KeepLast(100),
            remove_on_fail: Retention::KeepLast(500),
            delay: Duration::from_secs(5),
        }
    }
}

/// Per-call overrides merged onto a queue's default [`JobOptions`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub attempts: Option<u32>,
    pub timeout: Option<Duration>,
    pub backoff: Option<Backoff>,
    pub remove_on_complete: Option<Retention>,
    pub remove_on_fail: Option<Retention>,
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, n: u32) -> Self {
        self.attempts = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn remove_on_complete(mut self, retention: Retention) -> Self {
        self.remove_on_complete = Some(retention);
        self
    }

    pub fn remove_on_fail(mut self, retention: Retention) -> Self {
        self.remove_on_fail = Some(retention);
        self
    }

    pub fn delay(mut self, dur: Duration) -> Self {
        self.delay = Some(dur);
        self
    }

    pub fn resolve(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            // a job always gets at least one attempt
            attempts: self.attempts.unwrap_or(defaults.attempts).max(1),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            remove_on_complete: self.remove_on_complete.unwrap_or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.unwrap_or(defaults.remove_on_fail),
            delay: self.delay.unwrap_or(defaults.delay),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub payload: Value,
    pub options: JobOptions,
}

/// A job as the broker stores it, payload kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub state: JobState,
    pub attempts_made: u32,
    pub options: JobOptions,
    pub progress: u8,
    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
    pub stacktrace: Option<String>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// finished_at - processed_at, once the job has finished.
    pub fn processing_duration(&self) -> Option<chrono::Duration> {
        match (self.processed_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Whether the attempt budget pinned at enqueue time is used up.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.options.attempts
    }
}

/// Typed view of a job handed to handlers.
#[derive(Debug, Clone)]
pub struct Job<T> {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: T,
    pub attempts_made: u32,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl<T: DeserializeOwned> Job<T> {
    pub fn from_record(record: &JobRecord) -> Result<Self, serde_json::Error> {
        let payload = serde_json::from_value(record.payload.clone())?;
        Ok(Self {
            id: record.id,
            queue: record.queue.clone(),
            name: record.name.clone(),
            payload,
            attempts_made: record.attempts_made,
            options: record.options.clone(),
            created_at: record.created_at,
            processed_at: record.processed_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Delayed => self.delayed,
            JobState::Paused => self.paused,
        }
    }

    pub fn bump(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Paused => self.paused += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusSummary {
    pub exists: bool,
    pub state: Option<JobState>,
    pub progress: u8,
    pub data: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatusSummary {
    pub fn missing() -> Self {
        Self {
            exists: false,
            state: None,
            progress: 0,
            data: None,
            result: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            exists: true,
            state: Some(record.state),
            progress: record.progress,
            data: Some(record.payload.clone()),
            result: record.return_value.clone(),
            error: record.failed_reason.clone(),
            finished_at: record.finished_at,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_framework_policy() {
        let opts = JobOptions::default();
        assert_eq!(opts.attempts, 3);
        assert_eq!(opts.timeout, Duration::from_secs(60));
        assert_eq!(opts.backoff, Backoff::fixed(Duration::from_secs(10)));
        assert_eq!(opts.remove_on_complete, Retention::KeepLast(100));
        assert_eq!(opts.remove_on_fail, Retention::KeepLast(500));
        assert_eq!(opts.delay, Duration::from_secs(5));
    }

    #[test]
    fn overrides_merge_onto_defaults() {
        let opts = EnqueueOptions::new()
            .attempts(2)
            .delay(Duration::ZERO)
            .resolve(&JobOptions::default());

        assert_eq!(opts.attempts, 2);
        assert_eq!(opts.delay, Duration::ZERO);
        assert_eq!(opts.timeout, Duration::from_secs(60));
        assert_eq!(opts.remove_on_fail, Retention::KeepLast(500));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let opts = EnqueueOptions::new()
            .attempts(0)
            .resolve(&JobOptions::default());
        assert_eq!(opts.attempts, 1);
    }

    #[test]
    fn retention_db_encoding() {
        for r in [
            Retention::KeepAll,
            Retention::RemoveImmediately,
            Retention::KeepLast(100),
        ] {
            assert_eq!(Retention::from_db(r.to_db()), r);
        }
        assert_eq!(Retention::from_db(-7), Retention::KeepAll);
    }

    #[test]
    fn options_serialize_durations_as_millis() {
        let v = serde_json::to_value(JobOptions::default()).unwrap();
        assert_eq!(v["timeout"], 60_000);
        assert_eq!(v["backoff"]["type"], "fixed");
        assert_eq!(v["backoff"]["delay"], 10_000);
    }

    #[test]
    fn job_state_parse_accepts_case_and_whitespace() {
        assert_eq!(JobState::parse(" Failed "), Some(JobState::Failed));
        assert_eq!(JobState::parse("dlq"), None);
    }
}
