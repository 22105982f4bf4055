use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised to callers of the queue framework.
///
/// Failures that belong to a single job's lifecycle never surface here; they
/// become log lines and dead-letter entries. Only the caller's own action
/// (enqueue, construction, lookups, admin commands) can fail with this type.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("broker unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    #[error("broker closed")]
    Closed,

    #[error("broker rejected write to queue {queue}: {reason}")]
    Rejected { queue: String, reason: String },

    #[error("job name must not be empty")]
    InvalidJobName,

    #[error("job {id} not found in queue {queue}")]
    NotFound { queue: String, id: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => Self::Closed,
            other => Self::Unavailable(other),
        }
    }
}

impl QueueError {
    /// Whether the error means the broker could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Closed | Self::Rejected { .. })
    }
}

/// Failure reported by a job handler.
///
/// Returning this from a handler fails the current attempt and sends the job
/// down the retry / dead-letter pathway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub message: String,
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobError {}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid payload: {err}"))
    }
}
