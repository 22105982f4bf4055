use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{visible_state, Broker, StallResolution, StalledJob, STALLED_LIMIT_REASON};
use crate::error::QueueResult;
use crate::jobs::{
    Backoff, JobCounts, JobId, JobOptions, JobRecord, JobState, NewJob, Retention,
};

const JOB_COLUMNS: &str = r#"
    queue, id, name, payload_json, status,
    attempts_made, max_attempts, backoff_ms, timeout_ms, delay_ms,
    remove_on_complete, remove_on_fail,
    run_at, stalled_count, progress, return_value, failed_reason, stacktrace,
    created_at, processed_at, finished_at
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    queue: String,
    id: i64,
    name: String,
    payload_json: Value,
    status: String,

    attempts_made: i32,
    max_attempts: i32,
    backoff_ms: i64,
    timeout_ms: i64,
    delay_ms: i64,
    remove_on_complete: i32,
    remove_on_fail: i32,

    run_at: DateTime<Utc>,
    stalled_count: i32,
    progress: i16,
    return_value: Option<Value>,
    failed_reason: Option<String>,
    stacktrace: Option<String>,

    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn stored_state(&self) -> JobState {
        JobState::parse(&self.status).unwrap_or(JobState::Waiting)
    }

    fn options(&self) -> JobOptions {
        JobOptions {
            attempts: self.max_attempts.max(1) as u32,
            timeout: millis(self.timeout_ms),
            backoff: Backoff::fixed(millis(self.backoff_ms)),
            remove_on_complete: Retention::from_db(self.remove_on_complete),
            remove_on_fail: Retention::from_db(self.remove_on_fail),
            delay: millis(self.delay_ms),
        }
    }

    fn into_record(self, paused: bool) -> JobRecord {
        let state = visible_state(self.stored_state(), self.run_at, Utc::now(), paused);
        let options = self.options();
        JobRecord {
            id: self.id,
            queue: self.queue,
            name: self.name,
            payload: self.payload_json,
            state,
            attempts_made: self.attempts_made.max(0) as u32,
            options,
            progress: self.progress.clamp(0, 100) as u8,
            return_value: self.return_value,
            failed_reason: self.failed_reason,
            stacktrace: self.stacktrace,
            run_at: self.run_at,
            created_at: self.created_at,
            processed_at: self.processed_at,
            finished_at: self.finished_at,
        }
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

fn ms(dur: Duration) -> i64 {
    dur.as_millis().min(i64::MAX as u128) as i64
}

#[derive(sqlx::FromRow)]
struct CountsRow {
    ready: i64,
    delayed: i64,
    active: i64,
    completed: i64,
    failed: i64,
}

/// Postgres-backed broker.
///
/// Jobs live in `jobs`, keyed by `(queue, id)`. Claims use
/// `FOR UPDATE SKIP LOCKED` so concurrent workers across processes never
/// take the same job.
#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn prune(
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        state: JobState,
        retention: Retention,
    ) -> QueueResult<u64> {
        let Some(keep) = retention.keep() else {
            return Ok(0);
        };

        let res = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = $1
              AND status = $2
              AND id IN (
                SELECT id
                FROM jobs
                WHERE queue = $1 AND status = $2
                ORDER BY finished_at DESC NULLS LAST, id DESC
                OFFSET $3
              )
            "#,
        )
        .bind(queue)
        .bind(state.as_str())
        .bind(keep as i64)
        .execute(&mut **tx)
        .await?;

        Ok(res.rows_affected())
    }

    /// One more failed attempt on a locked row, inside `tx`.
    async fn record_failure(
        tx: &mut Transaction<'_, Postgres>,
        row: &JobRow,
        reason: &str,
        stack: Option<&str>,
    ) -> QueueResult<JobRow> {
        let attempts_made = row.attempts_made + 1;
        let next = if attempts_made < row.max_attempts {
            JobState::Waiting
        } else {
            JobState::Failed
        };

        let sql = format!(
            r#"
            UPDATE jobs
            SET status = $3,
                attempts_made = $4,
                run_at = CASE WHEN $3 = 'waiting'
                              THEN now() + (backoff_ms * interval '1 millisecond')
                              ELSE run_at END,
                finished_at = CASE WHEN $3 = 'failed' THEN now() ELSE finished_at END,
                failed_reason = $5,
                stacktrace = $6,
                lock_token = NULL,
                lock_expires_at = NULL
            WHERE queue = $1 AND id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );

        let updated = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&row.queue)
            .bind(row.id)
            .bind(next.as_str())
            .bind(attempts_made)
            .bind(reason)
            .bind(stack)
            .fetch_one(&mut **tx)
            .await?;

        Ok(updated)
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn add(&self, queue: &str, job: NewJob) -> QueueResult<JobRecord> {
        let sql = format!(
            r#"
            INSERT INTO jobs (
                queue, name, payload_json, status,
                max_attempts, backoff_ms, timeout_ms, delay_ms,
                remove_on_complete, remove_on_fail,
                run_at
            )
            VALUES (
                $1, $2, $3, 'waiting',
                $4, $5, $6, $7,
                $8, $9,
                now() + ($7::bigint * interval '1 millisecond')
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let opts = &job.options;
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(&job.name)
            .bind(&job.payload)
            .bind(opts.attempts.min(i32::MAX as u32) as i32)
            .bind(ms(opts.backoff.delay_for(0)))
            .bind(ms(opts.timeout))
            .bind(ms(opts.delay))
            .bind(opts.remove_on_complete.to_db())
            .bind(opts.remove_on_fail.to_db())
            .fetch_one(&self.pool)
            .await?;

        let paused = self.is_paused(queue).await?;
        Ok(row.into_record(paused))
    }

    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED, paused queues never match.
    async fn claim(
        &self,
        queue: &str,
        job_name: &str,
        token: Uuid,
        lock: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        let sql = format!(
            r#"
            WITH candidate AS (
              SELECT j.id AS cid
              FROM jobs j
              WHERE j.queue = $1
                AND j.name = $2
                AND j.status = 'waiting'
                AND j.run_at <= now()
                AND NOT EXISTS (
                  SELECT 1 FROM queue_state s WHERE s.queue = $1 AND s.paused
                )
              ORDER BY j.run_at ASC, j.id ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            UPDATE jobs
            SET status = 'active',
                lock_token = $3,
                lock_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                processed_at = now()
            FROM candidate
            WHERE jobs.queue = $1
              AND jobs.id = candidate.cid
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(job_name)
            .bind(token)
            .bind(ms(lock))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into_record(false)))
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        token: Uuid,
        lock: Duration,
    ) -> QueueResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_expires_at = now() + ($4::bigint * interval '1 millisecond')
            WHERE queue = $1
              AND id = $2
              AND status = 'active'
              AND lock_token = $3
            "#,
        )
        .bind(queue)
        .bind(id)
        .bind(token)
        .bind(ms(lock))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// The `lock_token` guard keeps a worker that lost its lock from finishing the job.
    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        token: Uuid,
        result: Value,
    ) -> QueueResult<Option<JobRecord>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'completed',
                finished_at = now(),
                return_value = $4,
                lock_token = NULL,
                lock_expires_at = NULL
            WHERE queue = $1
              AND id = $2
              AND status = 'active'
              AND lock_token = $3
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(id)
            .bind(token)
            .bind(&result)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        Self::prune(
            &mut tx,
            queue,
            JobState::Completed,
            Retention::from_db(row.remove_on_complete),
        )
        .await?;

        tx.commit().await?;
        Ok(Some(row.into_record(false)))
    }

    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        token: Uuid,
        reason: &str,
        stack: Option<&str>,
    ) -> QueueResult<Option<JobRecord>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE queue = $1
              AND id = $2
              AND status = 'active'
              AND lock_token = $3
            FOR UPDATE
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(id)
            .bind(token)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let updated = Self::record_failure(&mut tx, &row, reason, stack).await?;
        if updated.stored_state() == JobState::Failed {
            Self::prune(
                &mut tx,
                queue,
                JobState::Failed,
                Retention::from_db(updated.remove_on_fail),
            )
            .await?;
        }

        tx.commit().await?;
        let paused = self.is_paused(queue).await?;
        Ok(Some(updated.into_record(paused)))
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
        force_reason: Option<&str>,
    ) -> QueueResult<Vec<StalledJob>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE queue = $1
              AND status = 'active'
              AND lock_expires_at IS NOT NULL
              AND lock_expires_at < now()
            ORDER BY id ASC
            FOR UPDATE SKIP LOCKED
            "#
        );

        let lapsed = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .fetch_all(&mut *tx)
            .await?;

        let requeue_sql = format!(
            r#"
            UPDATE jobs
            SET status = 'waiting',
                run_at = now(),
                stalled_count = stalled_count + 1,
                lock_token = NULL,
                lock_expires_at = NULL
            WHERE queue = $1 AND id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );

        let mut resolved = Vec::with_capacity(lapsed.len());
        let mut failed_retention = None;

        for row in lapsed {
            let stalled_count = row.stalled_count.max(0) as u32 + 1;
            let reason = match force_reason {
                Some(reason) => Some(reason),
                None if stalled_count > max_stalled_count => Some(STALLED_LIMIT_REASON),
                None => None,
            };

            let (updated, resolution) = match reason {
                Some(reason) => {
                    sqlx::query("UPDATE jobs SET stalled_count = stalled_count + 1 WHERE queue = $1 AND id = $2")
                        .bind(queue)
                        .bind(row.id)
                        .execute(&mut *tx)
                        .await?;
                    let updated = Self::record_failure(&mut tx, &row, reason, None).await?;
                    if updated.stored_state() == JobState::Failed {
                        failed_retention = Some(Retention::from_db(updated.remove_on_fail));
                    }
                    (updated, StallResolution::Failed)
                }
                None => {
                    let updated = sqlx::query_as::<_, JobRow>(&requeue_sql)
                        .bind(queue)
                        .bind(row.id)
                        .fetch_one(&mut *tx)
                        .await?;
                    (updated, StallResolution::Requeued)
                }
            };

            resolved.push((updated, resolution));
        }

        if let Some(retention) = failed_retention {
            Self::prune(&mut tx, queue, JobState::Failed, retention).await?;
        }

        tx.commit().await?;

        let paused = self.is_paused(queue).await?;
        Ok(resolved
            .into_iter()
            .map(|(row, resolution)| StalledJob {
                record: row.into_record(paused),
                resolution,
            })
            .collect())
    }

    async fn get(&self, queue: &str, id: JobId) -> QueueResult<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE queue = $1 AND id = $2");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let paused = self.is_paused(queue).await?;
                Ok(Some(row.into_record(paused)))
            }
            None => Ok(None),
        }
    }

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        let row = sqlx::query_as::<_, CountsRow>(
            r#"
            SELECT
              COUNT(*) FILTER (WHERE status = 'waiting' AND run_at <= now()) AS ready,
              COUNT(*) FILTER (WHERE status = 'waiting' AND run_at >  now()) AS delayed,
              COUNT(*) FILTER (WHERE status = 'active')                      AS active,
              COUNT(*) FILTER (WHERE status = 'completed')                   AS completed,
              COUNT(*) FILTER (WHERE status = 'failed')                      AS failed
            FROM jobs
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        let paused = self.is_paused(queue).await?;
        let ready = row.ready.max(0) as u64;

        Ok(JobCounts {
            waiting: if paused { 0 } else { ready },
            paused: if paused { ready } else { 0 },
            delayed: row.delayed.max(0) as u64,
            active: row.active.max(0) as u64,
            completed: row.completed.max(0) as u64,
            failed: row.failed.max(0) as u64,
        })
    }

    async fn active_count(&self, queue: &str) -> QueueResult<u64> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = $1 AND status = 'active'")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;
        Ok(n.max(0) as u64)
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        let paused = self.is_paused(queue).await?;

        let filter = match state {
            JobState::Waiting if paused => return Ok(Vec::new()),
            JobState::Paused if !paused => return Ok(Vec::new()),
            JobState::Waiting | JobState::Paused => "status = 'waiting' AND run_at <= now()",
            JobState::Delayed => "status = 'waiting' AND run_at > now()",
            JobState::Active => "status = 'active'",
            JobState::Completed => "status = 'completed'",
            JobState::Failed => "status = 'failed'",
        };

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE queue = $1 AND {filter}
            ORDER BY id DESC
            LIMIT $2
            "#
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.into_record(paused)).collect())
    }

    async fn update_progress(&self, queue: &str, id: JobId, progress: u8) -> QueueResult<bool> {
        let res = sqlx::query("UPDATE jobs SET progress = $3 WHERE queue = $1 AND id = $2")
            .bind(queue)
            .bind(id)
            .bind(progress.min(100) as i16)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn pause(&self, queue: &str) -> QueueResult<()> {
        set_paused(&self.pool, queue, true).await
    }

    async fn resume(&self, queue: &str) -> QueueResult<()> {
        set_paused(&self.pool, queue, false).await
    }

    async fn is_paused(&self, queue: &str) -> QueueResult<bool> {
        let paused: Option<bool> =
            sqlx::query_scalar("SELECT paused FROM queue_state WHERE queue = $1")
                .bind(queue)
                .fetch_optional(&self.pool)
                .await?;
        Ok(paused.unwrap_or(false))
    }

    async fn clear(&self, queue: &str) -> QueueResult<u64> {
        let res = sqlx::query("DELETE FROM jobs WHERE queue = $1 AND status = 'waiting'")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn ping(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

async fn set_paused(pool: &PgPool, queue: &str, paused: bool) -> QueueResult<()> {
    sqlx::query(
        r#"
        INSERT INTO queue_state (queue, paused, updated_at)
        VALUES ($1, $2, now())
        ON CONFLICT (queue) DO UPDATE
        SET paused = EXCLUDED.paused,
            updated_at = now()
        "#,
    )
    .bind(queue)
    .bind(paused)
    .execute(pool)
    .await?;
    Ok(())
}
