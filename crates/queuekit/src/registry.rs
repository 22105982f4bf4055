use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::broker::BrokerHandle;
use crate::dashboard::Dashboard;
use crate::error::{QueueError, QueueResult};
use crate::jobs::{JobCounts, JobOptions, JobRecord, JobState};
use crate::policy::{DeadLetterEntry, DeadLetterPolicy};
use crate::queue::{JobQueue, QueueSettings};
use crate::shutdown::{DrainReport, DrainTarget, GracefulShutdownCoordinator};

/// Payload-agnostic view of a queue, used by the dashboard and shutdown.
#[async_trait]
pub trait ManagedQueue: DrainTarget {
    async fn counts(&self) -> QueueResult<JobCounts>;

    async fn jobs(&self, state: JobState, limit: usize) -> QueueResult<Vec<JobRecord>>;

    async fn paused(&self) -> QueueResult<bool>;
}

#[async_trait]
impl<T> ManagedQueue for JobQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn counts(&self) -> QueueResult<JobCounts> {
        self.get_job_counts().await
    }

    async fn jobs(&self, state: JobState, limit: usize) -> QueueResult<Vec<JobRecord>> {
        self.list_jobs(state, limit).await
    }

    async fn paused(&self) -> QueueResult<bool> {
        self.is_paused().await
    }
}

/// Registration record of a domain queue and the DLQ it routes into.
#[derive(Clone)]
pub struct QueueDescriptor {
    pub name: String,
    pub queue: Arc<dyn ManagedQueue>,
    pub dlq: String,
}

/// Creates and tracks every queue of the process.
///
/// Owns the single shared dead-letter queue: the first [`create_queue`] call
/// creates it as `<first queue>-DLQ`, every later queue reuses that instance.
///
/// [`create_queue`]: QueueRegistry::create_queue
pub struct QueueRegistry {
    broker: BrokerHandle,
    settings: QueueSettings,
    defaults: JobOptions,
    shared_dlq: OnceCell<JobQueue<DeadLetterEntry>>,
    queues: Mutex<Vec<QueueDescriptor>>,
    dashboard: Dashboard,
}

impl QueueRegistry {
    pub fn new(broker: BrokerHandle, settings: QueueSettings) -> Self {
        let dashboard = Dashboard::new(broker.broker().clone());
        Self {
            broker,
            settings,
            defaults: JobOptions::default(),
            shared_dlq: OnceCell::new(),
            queues: Mutex::new(Vec::new()),
            dashboard,
        }
    }

    /// Override the job defaults every queue merges enqueue options onto.
    pub fn with_job_defaults(mut self, defaults: JobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn dashboard(&self) -> &Dashboard {
        &self.dashboard
    }

    /// Return the shared DLQ, creating it under `name` if none exists yet.
    /// Once created, `name` is ignored.
    pub async fn get_or_create_shared_dlq(
        &self,
        name: &str,
    ) -> QueueResult<JobQueue<DeadLetterEntry>> {
        let dlq = self
            .shared_dlq
            .get_or_try_init(|| async {
                let dlq = JobQueue::<DeadLetterEntry>::open(
                    name,
                    &self.broker,
                    self.settings.clone(),
                    self.defaults.clone(),
                )
                .await?;
                tracing::info!(dlq = %name, "shared dead-letter queue created");
                Ok::<_, QueueError>(dlq)
            })
            .await?;

        self.dashboard
            .register(dlq.name(), Arc::new(dlq.clone()), true);
        Ok(dlq.clone())
    }

    pub fn shared_dlq(&self) -> Option<JobQueue<DeadLetterEntry>> {
        self.shared_dlq.get().cloned()
    }

    /// Open a domain queue with the dead-letter policy wired into its
    /// failure callbacks and register it with the dashboard.
    pub async fn create_queue<T>(&self, name: &str) -> QueueResult<JobQueue<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let dlq = self
            .get_or_create_shared_dlq(&format!("{name}-DLQ"))
            .await?;

        let queue = JobQueue::<T>::open(
            name,
            &self.broker,
            self.settings.clone(),
            self.defaults.clone(),
        )
        .await?;
        DeadLetterPolicy::new(dlq.clone()).attach(&queue);

        self.queues.lock().push(QueueDescriptor {
            name: name.to_string(),
            queue: Arc::new(queue.clone()),
            dlq: dlq.name().to_string(),
        });
        self.dashboard.register(name, Arc::new(queue.clone()), false);

        Ok(queue)
    }

    pub fn descriptors(&self) -> Vec<QueueDescriptor> {
        self.queues.lock().clone()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.lock().iter().map(|d| d.name.clone()).collect()
    }

    /// Shut down every domain queue concurrently, then the shared DLQ so that
    /// late dead-letter writes still land.
    pub async fn shutdown_all(&self) -> Vec<DrainReport> {
        let coordinator = GracefulShutdownCoordinator::new(self.settings.drain.clone());
        let queues: Vec<Arc<dyn ManagedQueue>> =
            self.queues.lock().iter().map(|d| d.queue.clone()).collect();

        let mut reports =
            futures::future::join_all(queues.iter().map(|q| coordinator.shutdown(q.as_ref())))
                .await;

        if let Some(dlq) = self.shared_dlq.get() {
            reports.push(coordinator.shutdown(dlq).await);
        }

        let unclean = reports.iter().filter(|r| !r.is_clean()).count();
        tracing::info!(queues = reports.len(), unclean, "all queues shut down");
        reports
    }
}
