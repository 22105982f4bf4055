use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::broker::{Broker, StallResolution};
use crate::error::{JobError, QueueResult};
use crate::queue::events::QueueEvents;

/// Failure reason recorded on a job whose worker stopped renewing its lock.
pub const STALLED_REASON: &str = "Job stalled";

/// Periodic sweep that turns lapsed job locks into failures.
///
/// Stalled jobs are never silently requeued: each one is forced through the
/// failure pathway with [`STALLED_REASON`] so it shows up as a countable
/// failure and can reach the dead-letter queue once its attempts run out.
pub struct StalledJobReaper {
    queue: String,
    broker: Arc<dyn Broker>,
    events: Arc<QueueEvents>,
    max_stalled_count: u32,
    interval: Duration,
}

impl StalledJobReaper {
    pub fn new(
        queue: &str,
        broker: Arc<dyn Broker>,
        events: Arc<QueueEvents>,
        max_stalled_count: u32,
        interval: Duration,
    ) -> Self {
        Self {
            queue: queue.to_string(),
            broker,
            events,
            max_stalled_count,
            interval,
        }
    }

    /// Run one sweep. Returns how many stalled jobs were found.
    pub async fn reap(&self) -> QueueResult<usize> {
        let stalled = self
            .broker
            .recover_stalled(&self.queue, self.max_stalled_count, Some(STALLED_REASON))
            .await?;

        for job in &stalled {
            self.events.emit_stalled(job.record.id).await;
            if job.resolution == StallResolution::Failed {
                let reason = job
                    .record
                    .failed_reason
                    .clone()
                    .unwrap_or_else(|| STALLED_REASON.to_string());
                self.events
                    .emit_failed(&job.record, &JobError::new(reason))
                    .await;
            }
        }

        Ok(stalled.len())
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately; nothing can be stalled yet
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.reap().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(queue = %self.queue, stalled = n, "reaped stalled jobs"),
                    Err(e) => self.events.emit_error(e).await,
                }
            }
        })
    }
}
