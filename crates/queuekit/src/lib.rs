//! Broker-backed background job queues with uniform retry, dead-letter
//! routing, stalled-job recovery, graceful shutdown and a read-only dashboard.

pub mod broker;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod jobs;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod telemetry;

pub use broker::{Broker, BrokerHandle, MemoryBroker, PgBroker};
pub use error::{JobError, QueueError, QueueResult};
pub use jobs::{
    Backoff, EnqueueOptions, Job, JobCounts, JobHandle, JobId, JobOptions, JobRecord, JobState,
    JobStatusSummary, Retention,
};
pub use policy::{DeadLetterEntry, DeadLetterPolicy};
pub use queue::{JobQueue, QueueSettings};
pub use registry::QueueRegistry;
pub use shutdown::{DrainConfig, GracefulShutdownCoordinator};
