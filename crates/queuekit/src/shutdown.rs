use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::QueueResult;

/// Bounds of the best-effort drain run before a queue is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainConfig {
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What the coordinator needs from a queue to drain and close it.
#[async_trait]
pub trait DrainTarget: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Flip the queue into shutdown. `false` if it was already shutting down.
    fn begin_shutdown(&self) -> bool;

    fn stop_claiming(&self);

    async fn active_jobs(&self) -> QueueResult<u64>;

    fn detach_listeners(&self);

    async fn close(&self) -> QueueResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Shutdown had already run (or was running) for this queue.
    AlreadyShutDown,
    Drained,
    TimedOut { remaining: u64 },
    /// The active count could not be read; the queue was closed anyway.
    CountUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub queue: String,
    pub outcome: DrainOutcome,
    pub waited: Duration,
    pub errors: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
            && matches!(
                self.outcome,
                DrainOutcome::Drained | DrainOutcome::AlreadyShutDown
            )
    }
}

/// Pause, wait (bounded) for active jobs, detach listeners, close.
///
/// Never fails: every error is logged and collected in the [`DrainReport`] so
/// one queue's shutdown cannot block another's.
#[derive(Debug, Clone, Default)]
pub struct GracefulShutdownCoordinator {
    config: DrainConfig,
}

impl GracefulShutdownCoordinator {
    pub fn new(config: DrainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    pub async fn shutdown<Q>(&self, target: &Q) -> DrainReport
    where
        Q: DrainTarget + ?Sized,
    {
        let started = Instant::now();
        let queue = target.queue_name().to_string();

        if !target.begin_shutdown() {
            tracing::debug!(queue = %queue, "shutdown already requested");
            return DrainReport {
                queue,
                outcome: DrainOutcome::AlreadyShutDown,
                waited: Duration::ZERO,
                errors: Vec::new(),
            };
        }

        tracing::info!(queue = %queue, "shutting down queue");
        target.stop_claiming();

        let mut errors = Vec::new();
        let outcome = self.drain(target, &queue, &mut errors).await;

        target.detach_listeners();

        if let Err(e) = target.close().await {
            tracing::error!(queue = %queue, error = %e, "error closing queue");
            errors.push(e.to_string());
        }

        let waited = started.elapsed();
        match outcome {
            DrainOutcome::TimedOut { remaining } => tracing::warn!(
                queue = %queue,
                remaining,
                waited_ms = waited.as_millis() as u64,
                "queue did not fully drain before shutdown"
            ),
            _ => tracing::info!(
                queue = %queue,
                waited_ms = waited.as_millis() as u64,
                "queue shut down"
            ),
        }

        DrainReport {
            queue,
            outcome,
            waited,
            errors,
        }
    }

    async fn drain<Q>(&self, target: &Q, queue: &str, errors: &mut Vec<String>) -> DrainOutcome
    where
        Q: DrainTarget + ?Sized,
    {
        let deadline = Instant::now() + self.config.max_wait;

        loop {
            let active = match target.active_jobs().await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(queue = %queue, error = %e, "could not read active job count");
                    errors.push(e.to_string());
                    return DrainOutcome::CountUnavailable;
                }
            };

            if active == 0 {
                return DrainOutcome::Drained;
            }

            let now = Instant::now();
            if now >= deadline {
                return DrainOutcome::TimedOut { remaining: active };
            }

            tracing::info!(queue = %queue, active, "waiting for {active} active jobs");
            let pause = self.config.poll_interval.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }
}

/// Resolves on SIGINT (ctrl-c) or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
