pub mod model;

pub use model::{
    Backoff, EnqueueOptions, Job, JobCounts, JobHandle, JobId, JobOptions, JobRecord, JobState,
    JobStatusSummary, NewJob, Retention,
};
