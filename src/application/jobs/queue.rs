use std::{sync::Arc, time::Duration};

use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::{
    application::repos::{
        FailureTransition, NewTaskRecord, QueueCounts, RepoError, StalledTask, TaskStore,
    },
    domain::{
        entities::{RenderPayload, RenderResult, RenderTaskRecord},
        error::DomainError,
        identifiers::{new_task_id, validate_task_id},
        types::TaskState,
    },
};

use super::status::TaskView;

const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_ATTEMPTS_CEILING: i32 = 25;

/// Hint returned to clients when the queue backend cannot be reached.
pub const SYNC_FALLBACK_HINT: &str =
    "the render queue is unavailable; POST /pdf/export renders the document synchronously";

/// Retry, visibility and retention policy for queued render tasks.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub default_max_attempts: i32,
    pub default_priority: i32,
    pub backoff_base: Duration,
    pub visibility_timeout: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_priority: 0,
            backoff_base: Duration::from_secs(2),
            visibility_timeout: Duration::from_secs(60),
            completed_retention: Duration::from_secs(24 * 60 * 60),
            failed_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl QueuePolicy {
    /// Delay before the retry that follows failed attempt number `attempts_made`:
    /// `base * 2^(attempts_made - 1)`.
    pub fn backoff_delay(&self, attempts_made: i32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).clamp(0, 20) as u32;
        self.backoff_base.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("render queue backend unavailable: {message}")]
    BackendUnavailable { message: String },
    #[error("task `{task_id}` already exists")]
    Duplicate { task_id: String },
    #[error("task `{task_id}` not found")]
    NotFound { task_id: String },
    #[error("lease on task `{task_id}` was lost")]
    LeaseLost { task_id: String },
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(RepoError),
}

impl QueueError {
    fn from_repo(err: RepoError, task_id: &str) -> Self {
        match err {
            RepoError::Unavailable(message) => Self::BackendUnavailable { message },
            RepoError::Duplicate { .. } => Self::Duplicate {
                task_id: task_id.to_string(),
            },
            RepoError::NotFound => Self::NotFound {
                task_id: task_id.to_string(),
            },
            RepoError::LeaseLost { task_id, .. } => Self::LeaseLost { task_id },
            other => Self::Store(other),
        }
    }
}

impl From<RepoError> for QueueError {
    fn from(err: RepoError) -> Self {
        Self::from_repo(err, "")
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Caller-chosen id for fire-and-forget submissions; generated when absent.
    pub task_id: Option<String>,
    pub payload: RenderPayload,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedTask {
    pub task_id: String,
    pub queue_position: u64,
}

/// A worker's claim on one task. The owner token is unique per lease, so a
/// reclaimed and re-leased task can never be completed through a stale lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub task_id: String,
    pub owner: String,
}

#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub lease: Lease,
    pub record: RenderTaskRecord,
}

#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub reason: String,
    /// Permanent failures skip any remaining attempts.
    pub permanent: bool,
}

impl TaskFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            permanent: false,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            permanent: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying {
        attempts_made: i32,
        retry_at: OffsetDateTime,
    },
    Failed {
        attempts_made: i32,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueueHealth {
    Healthy {
        healthy: bool,
        waiting: u64,
        delayed: u64,
        active: u64,
        completed: u64,
        failed: u64,
        total: u64,
    },
    Unhealthy {
        healthy: bool,
        error: String,
    },
}

impl QueueHealth {
    fn from_counts(counts: QueueCounts) -> Self {
        Self::Healthy {
            healthy: true,
            waiting: counts.waiting,
            delayed: counts.delayed,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            total: counts.waiting + counts.delayed + counts.active,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// Tasks removed by one retention pass.
#[derive(Debug, Default)]
pub struct PurgeReport {
    pub completed: Vec<RenderTaskRecord>,
    pub failed: Vec<RenderTaskRecord>,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

/// Client of the durable job queue: owns retry policy on top of a [`TaskStore`].
#[derive(Clone)]
pub struct RenderQueue {
    store: Arc<dyn TaskStore>,
    policy: QueuePolicy,
}

impl RenderQueue {
    pub fn new(store: Arc<dyn TaskStore>, policy: QueuePolicy) -> Self {
        Self { store, policy }
    }

    /// Persist a task in the `queued` state and report where it stands.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueuedTask, QueueError> {
        let task_id = match request.task_id {
            Some(id) => {
                validate_task_id(&id).map_err(DomainError::from)?;
                id
            }
            None => new_task_id(),
        };

        let max_attempts = request
            .max_attempts
            .unwrap_or(self.policy.default_max_attempts);
        if !(1..=MAX_ATTEMPTS_CEILING).contains(&max_attempts) {
            return Err(DomainError::validation(format!(
                "`maxAttempts` must be between 1 and {MAX_ATTEMPTS_CEILING}"
            ))
            .into());
        }

        let now = OffsetDateTime::now_utc();
        let record = NewTaskRecord {
            id: task_id.clone(),
            payload: request.payload,
            priority: request.priority.unwrap_or(self.policy.default_priority),
            max_attempts,
            created_at: now,
        };
        let template = record.payload.template.clone();
        let priority = record.priority;

        self.store
            .insert(record)
            .await
            .map_err(|err| QueueError::from_repo(err, &task_id))?;

        let queue_position = self
            .store
            .position(&task_id, now)
            .await
            .map_err(|err| QueueError::from_repo(err, &task_id))?
            .unwrap_or(0);

        counter!("docpress_tasks_enqueued_total").increment(1);
        info!(
            target = "application::jobs::queue",
            task_id = %task_id,
            template = %template,
            priority,
            max_attempts,
            queue_position,
            "task enqueued"
        );

        Ok(EnqueuedTask {
            task_id,
            queue_position,
        })
    }

    /// Lease the next ready task, or `None` when nothing is ready.
    pub async fn lease(&self, worker_id: &str) -> Result<Option<LeasedTask>, QueueError> {
        let owner = format!("{worker_id}/{}", new_task_id());
        let record = self
            .store
            .lease(
                &owner,
                OffsetDateTime::now_utc(),
                self.policy.visibility_timeout,
            )
            .await?;

        Ok(record.map(|record| LeasedTask {
            lease: Lease {
                task_id: record.id.clone(),
                owner,
            },
            record,
        }))
    }

    /// Advisory progress update; also renews the lease.
    pub async fn report_progress(&self, lease: &Lease, percent: u8) -> Result<(), QueueError> {
        self.store
            .touch_progress(
                &lease.task_id,
                &lease.owner,
                percent.min(100),
                OffsetDateTime::now_utc(),
                self.policy.visibility_timeout,
            )
            .await
            .map_err(|err| QueueError::from_repo(err, &lease.task_id))
    }

    pub async fn complete(&self, lease: &Lease, result: &RenderResult) -> Result<(), QueueError> {
        self.store
            .mark_completed(
                &lease.task_id,
                &lease.owner,
                result,
                OffsetDateTime::now_utc(),
            )
            .await
            .map_err(|err| QueueError::from_repo(err, &lease.task_id))?;

        counter!("docpress_tasks_completed_total").increment(1);
        Ok(())
    }

    /// Charge one attempt and either schedule a backoff retry or fail for good.
    pub async fn fail(
        &self,
        lease: &Lease,
        failure: &TaskFailure,
    ) -> Result<FailureOutcome, QueueError> {
        let record = self
            .store
            .find(&lease.task_id)
            .await
            .map_err(|err| QueueError::from_repo(err, &lease.task_id))?
            .ok_or_else(|| QueueError::NotFound {
                task_id: lease.task_id.clone(),
            })?;

        if !record.is_leased_by(&lease.owner) {
            return Err(QueueError::LeaseLost {
                task_id: lease.task_id.clone(),
            });
        }

        let now = OffsetDateTime::now_utc();
        let attempts_made = (record.attempts_made + 1).min(record.max_attempts);
        let retry_at = (!failure.permanent && attempts_made < record.max_attempts)
            .then(|| now + self.policy.backoff_delay(attempts_made));

        let transition = FailureTransition {
            attempts_made,
            reason: failure.reason.clone(),
            retry_at,
            now,
        };
        self.store
            .record_failure(&lease.task_id, &lease.owner, &transition)
            .await
            .map_err(|err| QueueError::from_repo(err, &lease.task_id))?;

        match retry_at {
            Some(retry_at) => {
                counter!("docpress_tasks_retried_total").increment(1);
                warn!(
                    target = "application::jobs::queue",
                    task_id = %lease.task_id,
                    attempts_made,
                    max_attempts = record.max_attempts,
                    retry_in_ms = (retry_at - now).whole_milliseconds() as i64,
                    reason = %failure.reason,
                    "task attempt failed, retry scheduled"
                );
                Ok(FailureOutcome::Retrying {
                    attempts_made,
                    retry_at,
                })
            }
            None => {
                counter!("docpress_tasks_failed_total").increment(1);
                warn!(
                    target = "application::jobs::queue",
                    task_id = %lease.task_id,
                    attempts_made,
                    max_attempts = record.max_attempts,
                    permanent = failure.permanent,
                    reason = %failure.reason,
                    "task failed permanently"
                );
                Ok(FailureOutcome::Failed { attempts_made })
            }
        }
    }

    /// Return tasks whose lease expired to the queue (or fail them when their
    /// attempt budget is spent).
    pub async fn reclaim_stalled(&self) -> Result<Vec<StalledTask>, QueueError> {
        let stalled = self
            .store
            .reclaim_stalled(OffsetDateTime::now_utc())
            .await?;

        for task in &stalled {
            counter!("docpress_tasks_stalled_total").increment(1);
            warn!(
                target = "application::jobs::queue",
                task_id = %task.id,
                attempts_made = task.attempts_made,
                max_attempts = task.max_attempts,
                state = task.state.as_str(),
                "stalled task reclaimed"
            );
        }

        Ok(stalled)
    }

    /// Look up a task and derive its client-facing view.
    pub async fn status(&self, task_id: &str) -> Result<TaskView, QueueError> {
        self.find(task_id).await.map(|record| TaskView::from_record(&record))
    }

    pub async fn find(&self, task_id: &str) -> Result<RenderTaskRecord, QueueError> {
        self.store
            .find(task_id)
            .await
            .map_err(|err| QueueError::from_repo(err, task_id))?
            .ok_or_else(|| QueueError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    pub async fn health(&self) -> QueueHealth {
        let result = async {
            self.store.ping().await?;
            self.store.counts().await
        }
        .await;

        match result {
            Ok(counts) => QueueHealth::from_counts(counts),
            Err(err) => QueueHealth::Unhealthy {
                healthy: false,
                error: err.to_string(),
            },
        }
    }

    /// Remove terminal tasks older than their retention window.
    pub async fn purge_expired(&self) -> Result<PurgeReport, QueueError> {
        let now = OffsetDateTime::now_utc();
        let completed = self
            .store
            .purge_finished(TaskState::Completed, now - self.policy.completed_retention)
            .await?;
        let failed = self
            .store
            .purge_finished(TaskState::Failed, now - self.policy.failed_retention)
            .await?;

        let report = PurgeReport { completed, failed };
        counter!("docpress_tasks_purged_total").increment(report.total() as u64);
        Ok(report)
    }

    /// Poll until the task is terminal or the timeout elapses.
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<RenderTaskRecord, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            let record = self.find(task_id).await?;
            if record.state.is_terminal() || Instant::now() >= deadline {
                return Ok(record);
            }
            sleep(DEFAULT_WAIT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let policy = QueuePolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_saturating() {
        let policy = QueuePolicy {
            backoff_base: Duration::from_secs(u64::MAX / 2),
            ..QueuePolicy::default()
        };
        assert_eq!(policy.backoff_delay(5), Duration::MAX);
        assert_eq!(QueuePolicy::default().backoff_delay(0), Duration::from_secs(2));
    }
}
