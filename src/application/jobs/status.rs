//! Client-facing task status, derived from queue-native state.

use serde::Serialize;
use time::OffsetDateTime;

use crate::domain::{
    entities::RenderTaskRecord,
    types::{TaskState, TaskStatus},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub file_size: u64,
    pub duration_ms: u64,
    pub template: String,
}

/// Response payload for a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    /// Percentage reported by the worker. Advisory: a `processing` task may
    /// sit at any value, and only `completed` guarantees 100.
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_made: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<i32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl TaskView {
    pub fn from_record(record: &RenderTaskRecord) -> Self {
        let status = TaskStatus::from(record.state);
        let retried = record.attempts_made > 0;

        let message = match record.state {
            TaskState::Waiting | TaskState::Delayed if retried => format!(
                "Waiting to retry after failed attempt {} of {}",
                record.attempts_made, record.max_attempts
            ),
            TaskState::Waiting | TaskState::Delayed => "Task is waiting in the queue".to_string(),
            TaskState::Active => "Task is being processed".to_string(),
            TaskState::Completed => "Document is ready for download".to_string(),
            TaskState::Failed => format!(
                "Task failed after {} of {} attempts",
                record.attempts_made, record.max_attempts
            ),
        };

        let progress = match record.state {
            TaskState::Completed => 100,
            _ => record.progress.min(100),
        };

        let result = match record.state {
            TaskState::Completed => record.result.as_ref().map(|result| ResultSummary {
                file_size: result.file_size,
                duration_ms: result.duration_ms,
                template: result.template.clone(),
            }),
            _ => None,
        };

        let error = match record.state {
            TaskState::Failed => Some(
                record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "task failed without error text".to_string()),
            ),
            TaskState::Waiting | TaskState::Delayed => record.last_error.clone(),
            _ => None,
        };

        let (attempts_made, max_attempts) = if retried || record.state == TaskState::Failed {
            (Some(record.attempts_made), Some(record.max_attempts))
        } else {
            (None, None)
        };

        Self {
            task_id: record.id.clone(),
            status,
            progress,
            message,
            result,
            error,
            attempts_made,
            max_attempts,
            created_at: record.created_at,
            processed_at: record.processed_at,
            finished_at: record.finished_at,
        }
    }
}
