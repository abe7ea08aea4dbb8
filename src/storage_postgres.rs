use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::{Client, Row, Transaction};
use uuid::Uuid;

use crate::error::{HandlerError, StoreError};
use crate::queue::{abandoned_error, apply_failure, RetrySchedule};
use crate::storage::{InsertOutcome, QueueStore, StaleAttempt};
use crate::types::{JobId, JobState, QueueCounts, QueuedJob, RetryPolicy};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS integration_queues (
    name TEXT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS integration_jobs (
    id UUID PRIMARY KEY,
    queue TEXT NOT NULL REFERENCES integration_queues (name) ON DELETE CASCADE,
    payload JSONB NOT NULL,
    state TEXT NOT NULL,
    retry_count BIGINT NOT NULL DEFAULT 0,
    retry_limit BIGINT NOT NULL,
    retry_delay_secs BIGINT NOT NULL,
    retry_backoff BOOLEAN NOT NULL,
    expire_in_secs BIGINT NOT NULL,
    singleton_key TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    start_after TIMESTAMPTZ NOT NULL,
    expire_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS integration_jobs_fetch
    ON integration_jobs (queue, state, start_after, created_at);

CREATE UNIQUE INDEX IF NOT EXISTS integration_jobs_singleton
    ON integration_jobs (queue, singleton_key)
    WHERE singleton_key IS NOT NULL
      AND state IN ('pending', 'retry_scheduled', 'in_flight');

CREATE INDEX IF NOT EXISTS integration_jobs_finished
    ON integration_jobs (queue, completed_at)
    WHERE state IN ('completed', 'exhausted', 'expired');
";

const COLUMNS: &str = "id, queue, payload, state, retry_count, retry_limit, retry_delay_secs, \
    retry_backoff, expire_in_secs, singleton_key, created_at, start_after, expire_at, \
    started_at, completed_at, last_error";

const UNFINISHED: &str = "('pending', 'retry_scheduled', 'in_flight')";
const WAITING: &str = "('pending', 'retry_scheduled')";
const FINISHED: &str = "('completed', 'exhausted', 'expired')";

/// PostgreSQL-backed job store.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so several processes may consume
/// the same tables. Failure bookkeeping locks the job row for the
/// read-modify-write.
pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    /// Wrap a connected client, creating the schema if missing.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client.batch_execute(SCHEMA).await?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn corrupt(column: &str, id: Uuid) -> StoreError {
    StoreError::Corrupt(format!("job {id}: bad {column}"))
}

fn row_to_job(row: &Row) -> Result<QueuedJob, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let state: String = row.try_get("state")?;
    let state = JobState::parse(&state).ok_or_else(|| corrupt("state", id))?;
    let count = |column: &str| -> Result<u64, StoreError> {
        let value: i64 = row.try_get(column)?;
        u64::try_from(value).map_err(|_| corrupt(column, id))
    };
    let retry_count = u32::try_from(count("retry_count")?).map_err(|_| corrupt("retry_count", id))?;
    let retry_limit = u32::try_from(count("retry_limit")?).map_err(|_| corrupt("retry_limit", id))?;

    Ok(QueuedJob {
        id: JobId(id),
        queue: row.try_get("queue")?,
        payload: row.try_get("payload")?,
        state,
        retry_count,
        policy: RetryPolicy {
            retry_limit,
            retry_delay_secs: count("retry_delay_secs")?,
            retry_backoff: row.try_get("retry_backoff")?,
            expire_in_secs: count("expire_in_secs")?,
        },
        singleton_key: row.try_get("singleton_key")?,
        created_at: row.try_get("created_at")?,
        start_after: row.try_get("start_after")?,
        expire_at: row.try_get("expire_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        last_error: row.try_get("last_error")?,
    })
}

async fn store_failure(tx: &Transaction<'_>, job: &QueuedJob) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE integration_jobs
         SET state = $2, retry_count = $3, start_after = $4, completed_at = $5, last_error = $6
         WHERE id = $1",
        &[
            &job.id.0,
            &job.state.as_str(),
            &i64::from(job.retry_count),
            &job.start_after,
            &job.completed_at,
            &job.last_error,
        ],
    )
    .await?;
    Ok(())
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn create_queue(&self, name: &str) -> Result<(), StoreError> {
        self.client
            .lock()
            .await
            .execute(
                "INSERT INTO integration_queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
                &[&name],
            )
            .await?;
        Ok(())
    }

    async fn queue_exists(&self, name: &str) -> Result<bool, StoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt("SELECT 1 FROM integration_queues WHERE name = $1", &[&name])
            .await?;
        Ok(row.is_some())
    }

    async fn insert(&self, job: QueuedJob) -> Result<InsertOutcome, StoreError> {
        let client = self.client.lock().await;
        let declared = client
            .query_opt("SELECT 1 FROM integration_queues WHERE name = $1", &[&job.queue])
            .await?;
        if declared.is_none() {
            return Err(StoreError::UnknownQueue(job.queue));
        }

        let insert = format!(
            "INSERT INTO integration_jobs ({COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             ON CONFLICT DO NOTHING
             RETURNING id"
        );
        let find_existing = format!(
            "SELECT id FROM integration_jobs
             WHERE queue = $1 AND singleton_key = $2 AND state IN {UNFINISHED}
             LIMIT 1"
        );

        // The unfinished holder of a singleton key may finish between the
        // conflicting insert and the lookup; one more insert settles it.
        for _ in 0..2 {
            let inserted = client
                .query_opt(
                    insert.as_str(),
                    &[
                        &job.id.0,
                        &job.queue,
                        &job.payload,
                        &job.state.as_str(),
                        &i64::from(job.retry_count),
                        &i64::from(job.policy.retry_limit),
                        &to_i64(job.policy.retry_delay_secs),
                        &job.policy.retry_backoff,
                        &to_i64(job.policy.expire_in_secs),
                        &job.singleton_key,
                        &job.created_at,
                        &job.start_after,
                        &job.expire_at,
                        &job.started_at,
                        &job.completed_at,
                        &job.last_error,
                    ],
                )
                .await?;
            if inserted.is_some() {
                return Ok(InsertOutcome::Inserted(job.id));
            }

            let Some(key) = job.singleton_key.as_deref() else {
                return Err(StoreError::Corrupt(format!("job id {} already exists", job.id)));
            };
            let existing = client
                .query_opt(find_existing.as_str(), &[&job.queue, &key])
                .await?;
            if let Some(row) = existing {
                let id: Uuid = row.try_get("id")?;
                return Ok(InsertOutcome::Duplicate { existing: JobId(id) });
            }
        }

        Err(StoreError::Corrupt(format!(
            "job id {} conflicts without a singleton holder",
            job.id
        )))
    }

    async fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedJob>, StoreError> {
        let sql = format!(
            "UPDATE integration_jobs SET state = 'in_flight', started_at = $2
             WHERE id = (
                 SELECT id FROM integration_jobs
                 WHERE queue = $1 AND state IN {WAITING}
                   AND start_after <= $2 AND expire_at > $2
                 ORDER BY start_after, created_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {COLUMNS}"
        );
        let row = self
            .client
            .lock()
            .await
            .query_opt(sql.as_str(), &[&queue, &now])
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let updated = self
            .client
            .lock()
            .await
            .execute(
                "UPDATE integration_jobs
                 SET state = 'completed', completed_at = $2, last_error = NULL
                 WHERE id = $1 AND state = 'in_flight'",
                &[&id.0, &now],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn fail(
        &self,
        id: JobId,
        error: &HandlerError,
        now: DateTime<Utc>,
        schedule: &RetrySchedule,
    ) -> Result<Option<QueuedJob>, StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let sql = format!("SELECT {COLUMNS} FROM integration_jobs WHERE id = $1 FOR UPDATE");
        let Some(row) = tx.query_opt(sql.as_str(), &[&id.0]).await? else {
            return Ok(None);
        };
        let mut job = row_to_job(&row)?;
        if job.state != JobState::InFlight {
            return Ok(None);
        }

        apply_failure(&mut job, error, now, schedule);
        store_failure(&tx, &job).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn expire_due(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedJob>, StoreError> {
        let sql = format!(
            "UPDATE integration_jobs SET state = 'expired', completed_at = $2
             WHERE queue = $1 AND state IN {WAITING} AND expire_at <= $2
             RETURNING {COLUMNS}"
        );
        let rows = self
            .client
            .lock()
            .await
            .query(sql.as_str(), &[&queue, &now])
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn fail_stale(
        &self,
        queue: &str,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
        schedule: &RetrySchedule,
    ) -> Result<Vec<StaleAttempt>, StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let sql = format!(
            "SELECT {COLUMNS} FROM integration_jobs
             WHERE queue = $1 AND state = 'in_flight' AND started_at < $2
             FOR UPDATE SKIP LOCKED"
        );
        let rows = tx.query(sql.as_str(), &[&queue, &started_before]).await?;

        let error = abandoned_error();
        let mut failed = Vec::with_capacity(rows.len());
        for row in &rows {
            let claimed = row_to_job(row)?;
            let mut updated = claimed.clone();
            apply_failure(&mut updated, &error, now, schedule);
            store_failure(&tx, &updated).await?;
            failed.push(StaleAttempt { claimed, updated });
        }
        tx.commit().await?;
        Ok(failed)
    }

    async fn job(&self, id: JobId) -> Result<Option<QueuedJob>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM integration_jobs WHERE id = $1");
        let row = self
            .client
            .lock()
            .await
            .query_opt(sql.as_str(), &[&id.0])
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        let rows = self
            .client
            .lock()
            .await
            .query(
                "SELECT state, count(*) AS n FROM integration_jobs WHERE queue = $1 GROUP BY state",
                &[&queue],
            )
            .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            if let Some(state) = JobState::parse(&state) {
                counts.add(state, u64::try_from(n).unwrap_or_default());
            }
        }
        Ok(counts)
    }

    async fn purge(&self, queue: &str) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM integration_jobs WHERE queue = $1 AND state IN {UNFINISHED}");
        let purged = self
            .client
            .lock()
            .await
            .execute(sql.as_str(), &[&queue])
            .await?;
        Ok(purged)
    }

    async fn prune(&self, queue: &str, finished_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM integration_jobs
             WHERE queue = $1 AND state IN {FINISHED} AND completed_at < $2"
        );
        let pruned = self
            .client
            .lock()
            .await
            .execute(sql.as_str(), &[&queue, &finished_before])
            .await?;
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listed(set: &str) -> Vec<JobState> {
        set.trim_matches(|c| c == '(' || c == ')')
            .split(',')
            .filter_map(|s| JobState::parse(s.trim().trim_matches('\'')))
            .collect()
    }

    #[test]
    fn state_sets_partition_job_states() {
        let finished = listed(FINISHED);
        let unfinished = listed(UNFINISHED);
        let waiting = listed(WAITING);
        for state in [
            JobState::Pending,
            JobState::InFlight,
            JobState::RetryScheduled,
            JobState::Completed,
            JobState::Exhausted,
            JobState::Expired,
        ] {
            assert_eq!(finished.contains(&state), state.is_finished(), "{state:?}");
            assert_eq!(unfinished.contains(&state), !state.is_finished(), "{state:?}");
            assert_eq!(waiting.contains(&state), state.is_waiting(), "{state:?}");
        }
    }
}
