use std::{convert::TryFrom, time::Duration};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    application::repos::{
        FailureTransition, NewTaskRecord, QueueCounts, RepoError, STALLED_FAILURE_REASON,
        StalledTask, TaskStore,
    },
    domain::{
        entities::{RenderPayload, RenderResult, RenderTaskRecord},
        types::TaskState,
    },
};

use super::{PostgresTaskStore, map_sqlx_error};

const TASK_COLUMNS: &str = "id, payload, priority, state, attempts_made, max_attempts, progress, \
    run_at, lease_owner, lease_expires_at, result, failure_reason, last_error, created_at, \
    processed_at, finished_at";

/// Last error recorded on a task whose lease ran out.
const LEASE_EXPIRED_ERROR: &str = "lease expired before the task finished";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    payload: serde_json::Value,
    priority: i32,
    state: String,
    attempts_made: i32,
    max_attempts: i32,
    progress: i16,
    run_at: OffsetDateTime,
    lease_owner: Option<String>,
    lease_expires_at: Option<OffsetDateTime>,
    result: Option<serde_json::Value>,
    failure_reason: Option<String>,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    finished_at: Option<OffsetDateTime>,
}

impl TryFrom<TaskRow> for RenderTaskRecord {
    type Error = RepoError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let state = TaskState::try_from(row.state.as_str()).map_err(|_| {
            RepoError::from_persistence(format!("unknown task state `{}`", row.state))
        })?;

        let payload: RenderPayload = serde_json::from_value(row.payload).map_err(|err| {
            RepoError::from_persistence(format!("task `{}` has a malformed payload: {err}", row.id))
        })?;

        let result = row
            .result
            .map(serde_json::from_value::<RenderResult>)
            .transpose()
            .map_err(|err| {
                RepoError::from_persistence(format!(
                    "task `{}` has a malformed result: {err}",
                    row.id
                ))
            })?;

        Ok(Self {
            id: row.id,
            payload,
            priority: row.priority,
            state,
            attempts_made: row.attempts_made,
            max_attempts: row.max_attempts,
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(0),
            run_at: row.run_at,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            result,
            failure_reason: row.failure_reason,
            last_error: row.last_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
            finished_at: row.finished_at,
        })
    }
}

fn lease_deadline(now: OffsetDateTime, visibility: Duration) -> OffsetDateTime {
    now + visibility
}

fn lease_lost(id: &str, owner: &str) -> RepoError {
    RepoError::LeaseLost {
        task_id: id.to_string(),
        owner: owner.to_string(),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, RepoError> {
    serde_json::to_value(value).map_err(RepoError::from_persistence)
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert(&self, task: NewTaskRecord) -> Result<RenderTaskRecord, RepoError> {
        let payload = to_json(&task.payload)?;
        let sql = format!(
            "INSERT INTO render_tasks \
                 (id, template, payload, priority, state, max_attempts, run_at, created_at) \
             VALUES ($1, $2, $3, $4, 'waiting', $5, $6, $6) \
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(&task.id)
            .bind(&task.payload.template)
            .bind(payload)
            .bind(task.priority)
            .bind(task.max_attempts)
            .bind(task.created_at)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        RenderTaskRecord::try_from(row)
    }

    async fn lease(
        &self,
        owner: &str,
        now: OffsetDateTime,
        visibility: Duration,
    ) -> Result<Option<RenderTaskRecord>, RepoError> {
        let sql = format!(
            "UPDATE render_tasks \
                SET state = 'active', \
                    lease_owner = $1, \
                    lease_expires_at = $3, \
                    processed_at = $2, \
                    progress = 0 \
              WHERE id = ( \
                    SELECT id FROM render_tasks \
                     WHERE state IN ('waiting', 'delayed') AND run_at <= $2 \
                     ORDER BY priority ASC, seq ASC \
                     LIMIT 1 \
                     FOR UPDATE SKIP LOCKED) \
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(owner)
            .bind(now)
            .bind(lease_deadline(now, visibility))
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(RenderTaskRecord::try_from).transpose()
    }

    async fn touch_progress(
        &self,
        id: &str,
        owner: &str,
        progress: u8,
        now: OffsetDateTime,
        visibility: Duration,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE render_tasks \
                SET progress = $3, lease_expires_at = $4 \
              WHERE id = $1 AND lease_owner = $2 AND state = 'active'",
        )
        .bind(id)
        .bind(owner)
        .bind(i16::from(progress.min(100)))
        .bind(lease_deadline(now, visibility))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(lease_lost(id, owner));
        }
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: &str,
        owner: &str,
        result: &RenderResult,
        now: OffsetDateTime,
    ) -> Result<(), RepoError> {
        let outcome = sqlx::query(
            "UPDATE render_tasks \
                SET state = 'completed', \
                    progress = 100, \
                    result = $3, \
                    finished_at = $4, \
                    lease_owner = NULL, \
                    lease_expires_at = NULL \
              WHERE id = $1 AND lease_owner = $2 AND state = 'active'",
        )
        .bind(id)
        .bind(owner)
        .bind(to_json(result)?)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if outcome.rows_affected() == 0 {
            return Err(lease_lost(id, owner));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: &str,
        owner: &str,
        transition: &FailureTransition,
    ) -> Result<(), RepoError> {
        let outcome = match transition.retry_at {
            Some(retry_at) => {
                sqlx::query(
                    "UPDATE render_tasks \
                        SET state = 'delayed', \
                            attempts_made = $3, \
                            last_error = $4, \
                            run_at = $5, \
                            lease_owner = NULL, \
                            lease_expires_at = NULL \
                      WHERE id = $1 AND lease_owner = $2 AND state = 'active'",
                )
                .bind(id)
                .bind(owner)
                .bind(transition.attempts_made)
                .bind(&transition.reason)
                .bind(retry_at)
                .execute(self.pool())
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE render_tasks \
                        SET state = 'failed', \
                            attempts_made = $3, \
                            last_error = $4, \
                            failure_reason = $4, \
                            finished_at = $5, \
                            lease_owner = NULL, \
                            lease_expires_at = NULL \
                      WHERE id = $1 AND lease_owner = $2 AND state = 'active'",
                )
                .bind(id)
                .bind(owner)
                .bind(transition.attempts_made)
                .bind(&transition.reason)
                .bind(transition.now)
                .execute(self.pool())
                .await
            }
        }
        .map_err(map_sqlx_error)?;

        if outcome.rows_affected() == 0 {
            return Err(lease_lost(id, owner));
        }
        Ok(())
    }

    async fn reclaim_stalled(&self, now: OffsetDateTime) -> Result<Vec<StalledTask>, RepoError> {
        let rows: Vec<(String, i32, i32, String)> = sqlx::query_as(
            "UPDATE render_tasks \
                SET attempts_made = attempts_made + 1, \
                    state = CASE WHEN attempts_made + 1 >= max_attempts \
                                 THEN 'failed' ELSE 'waiting' END, \
                    failure_reason = CASE WHEN attempts_made + 1 >= max_attempts \
                                          THEN $2 ELSE failure_reason END, \
                    finished_at = CASE WHEN attempts_made + 1 >= max_attempts \
                                       THEN $1 ELSE NULL END, \
                    last_error = $3, \
                    run_at = $1, \
                    lease_owner = NULL, \
                    lease_expires_at = NULL \
              WHERE state = 'active' AND lease_expires_at <= $1 \
             RETURNING id, attempts_made, max_attempts, state",
        )
        .bind(now)
        .bind(STALLED_FAILURE_REASON)
        .bind(LEASE_EXPIRED_ERROR)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|(id, attempts_made, max_attempts, state)| {
                let state = TaskState::try_from(state.as_str()).map_err(|_| {
                    RepoError::from_persistence(format!("unknown task state `{state}`"))
                })?;
                Ok(StalledTask {
                    id,
                    attempts_made,
                    max_attempts,
                    state,
                })
            })
            .collect()
    }

    async fn find(&self, id: &str) -> Result<Option<RenderTaskRecord>, RepoError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM render_tasks WHERE id = $1");
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(RenderTaskRecord::try_from).transpose()
    }

    async fn position(&self, id: &str, now: OffsetDateTime) -> Result<Option<u64>, RepoError> {
        let position: Option<(Option<i64>,)> = sqlx::query_as(
            "SELECT CASE WHEN t.state IN ('waiting', 'delayed') THEN ( \
                        SELECT COUNT(*) FROM render_tasks o \
                         WHERE o.state IN ('waiting', 'delayed') \
                           AND o.run_at <= $2 \
                           AND (o.priority, o.seq) < (t.priority, t.seq)) + 1 \
                    END \
               FROM render_tasks t \
              WHERE t.id = $1",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        match position {
            None => Err(RepoError::NotFound),
            Some((value,)) => value
                .map(|value| {
                    u64::try_from(value)
                        .map_err(|_| RepoError::from_persistence("position out of range"))
                })
                .transpose(),
        }
    }

    async fn counts(&self) -> Result<QueueCounts, RepoError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM render_tasks GROUP BY state")
                .fetch_all(self.pool())
                .await
                .map_err(map_sqlx_error)?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let count = u64::try_from(count)
                .map_err(|_| RepoError::from_persistence("count exceeds supported range"))?;
            match TaskState::try_from(state.as_str()) {
                Ok(TaskState::Waiting) => counts.waiting = count,
                Ok(TaskState::Delayed) => counts.delayed = count,
                Ok(TaskState::Active) => counts.active = count,
                Ok(TaskState::Completed) => counts.completed = count,
                Ok(TaskState::Failed) => counts.failed = count,
                Err(_) => {
                    return Err(RepoError::from_persistence(format!(
                        "unknown task state `{state}`"
                    )));
                }
            }
        }
        Ok(counts)
    }

    async fn purge_finished(
        &self,
        state: TaskState,
        finished_before: OffsetDateTime,
    ) -> Result<Vec<RenderTaskRecord>, RepoError> {
        if !state.is_terminal() {
            return Err(RepoError::InvalidInput {
                message: format!("cannot purge tasks in `{}` state", state.as_str()),
            });
        }

        let sql = format!(
            "DELETE FROM render_tasks \
              WHERE state = $1 AND finished_at < $2 \
             RETURNING {TASK_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(state.as_str())
            .bind(finished_before)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(RenderTaskRecord::try_from).collect()
    }

    async fn ping(&self) -> Result<(), RepoError> {
        self.health_check().await.map_err(map_sqlx_error)
    }
}
