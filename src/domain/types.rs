//! Shared domain enumerations aligned with persisted task states.

use serde::{Deserialize, Serialize};

/// Lifecycle state as stored by the durable queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ready to be leased as soon as a worker asks.
    Waiting,
    /// Waiting for its backoff delay to elapse before becoming ready.
    Delayed,
    /// Leased by a worker.
    Active,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Delayed => "delayed",
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// States a worker may lease from once `run_at` has passed.
    pub fn is_leasable(self) -> bool {
        matches!(self, TaskState::Waiting | TaskState::Delayed)
    }
}

impl TryFrom<&str> for TaskState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "waiting" => Ok(TaskState::Waiting),
            "delayed" => Ok(TaskState::Delayed),
            "active" => Ok(TaskState::Active),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            _ => Err(()),
        }
    }
}

/// Client-facing status derived from [`TaskState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl From<TaskState> for TaskStatus {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Waiting | TaskState::Delayed => TaskStatus::Queued,
            TaskState::Active => TaskStatus::Processing,
            TaskState::Completed => TaskStatus::Completed,
            TaskState::Failed => TaskStatus::Failed,
        }
    }
}
