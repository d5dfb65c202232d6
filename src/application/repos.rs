//! Repository traits describing the durable queue backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{RenderPayload, RenderResult, RenderTaskRecord};
use crate::domain::types::TaskState;

/// Failure reason recorded when a lease expires with no attempts left.
pub const STALLED_FAILURE_REASON: &str = "task stalled more than allowable limit";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("queue store unavailable: {0}")]
    Unavailable(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("lease on task `{task_id}` is no longer held by `{owner}`")]
    LeaseLost { task_id: String, owner: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewTaskRecord {
    pub id: String,
    pub payload: RenderPayload,
    pub priority: i32,
    pub max_attempts: i32,
    pub created_at: OffsetDateTime,
}

/// How a failed attempt resolves, decided by the queue layer.
#[derive(Debug, Clone)]
pub struct FailureTransition {
    pub attempts_made: i32,
    pub reason: String,
    /// `Some` schedules a retry (state `Delayed`); `None` fails permanently.
    pub retry_at: Option<OffsetDateTime>,
    pub now: OffsetDateTime,
}

/// A lease that expired and was handed back by [`TaskStore::reclaim_stalled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledTask {
    pub id: String,
    pub attempts_made: i32,
    pub max_attempts: i32,
    /// State after reclamation: `Waiting` or `Failed`.
    pub state: TaskState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Atomic lifecycle operations on persisted render tasks.
///
/// Every transition is a single backend operation so that multiple worker
/// processes can share one store without application-level locks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: NewTaskRecord) -> Result<RenderTaskRecord, RepoError>;

    /// Lease the ready task with the lowest priority value, oldest first.
    async fn lease(
        &self,
        owner: &str,
        now: OffsetDateTime,
        visibility: Duration,
    ) -> Result<Option<RenderTaskRecord>, RepoError>;

    /// Record progress and push the lease deadline out by `visibility`.
    async fn touch_progress(
        &self,
        id: &str,
        owner: &str,
        progress: u8,
        now: OffsetDateTime,
        visibility: Duration,
    ) -> Result<(), RepoError>;

    async fn mark_completed(
        &self,
        id: &str,
        owner: &str,
        result: &RenderResult,
        now: OffsetDateTime,
    ) -> Result<(), RepoError>;

    async fn record_failure(
        &self,
        id: &str,
        owner: &str,
        transition: &FailureTransition,
    ) -> Result<(), RepoError>;

    /// Hand expired leases back to the queue, charging one attempt each.
    async fn reclaim_stalled(&self, now: OffsetDateTime) -> Result<Vec<StalledTask>, RepoError>;

    async fn find(&self, id: &str) -> Result<Option<RenderTaskRecord>, RepoError>;

    /// 1-based position among tasks leasable at `now`, `None` once the task is
    /// no longer queued. Tasks waiting out a retry delay are not counted ahead.
    async fn position(&self, id: &str, now: OffsetDateTime) -> Result<Option<u64>, RepoError>;

    async fn counts(&self) -> Result<QueueCounts, RepoError>;

    /// Delete terminal tasks in `state` finished before `finished_before`.
    async fn purge_finished(
        &self,
        state: TaskState,
        finished_before: OffsetDateTime,
    ) -> Result<Vec<RenderTaskRecord>, RepoError>;

    async fn ping(&self) -> Result<(), RepoError>;
}
