//! In-process task store for single-node deployments and tests.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::{
    application::repos::{
        FailureTransition, NewTaskRecord, QueueCounts, RepoError, STALLED_FAILURE_REASON,
        StalledTask, TaskStore,
    },
    domain::{
        entities::{RenderResult, RenderTaskRecord},
        types::TaskState,
    },
};

const LEASE_EXPIRED_ERROR: &str = "lease expired before the task finished";

struct StoredTask {
    seq: u64,
    record: RenderTaskRecord,
}

impl StoredTask {
    fn is_ready(&self) -> bool {
        self.record.state.is_leasable()
    }

    fn order_key(&self) -> (i32, u64) {
        (self.record.priority, self.seq)
    }
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, StoredTask>,
    next_seq: u64,
}

impl MemoryState {
    fn leased_mut(&mut self, id: &str, owner: &str) -> Result<&mut RenderTaskRecord, RepoError> {
        match self.tasks.get_mut(id) {
            Some(task) if task.record.is_leased_by(owner) => Ok(&mut task.record),
            Some(_) => Err(RepoError::LeaseLost {
                task_id: id.to_string(),
                owner: owner.to_string(),
            }),
            None => Err(RepoError::NotFound),
        }
    }
}

/// Task store held in process memory. Tasks do not survive a restart and
/// cannot be shared with worker processes.
#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn release_lease(record: &mut RenderTaskRecord) {
    record.lease_owner = None;
    record.lease_expires_at = None;
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: NewTaskRecord) -> Result<RenderTaskRecord, RepoError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(RepoError::Duplicate {
                constraint: "render_tasks_pkey".to_string(),
            });
        }

        state.next_seq += 1;
        let record = RenderTaskRecord {
            id: task.id.clone(),
            payload: task.payload,
            priority: task.priority,
            state: TaskState::Waiting,
            attempts_made: 0,
            max_attempts: task.max_attempts,
            progress: 0,
            run_at: task.created_at,
            lease_owner: None,
            lease_expires_at: None,
            result: None,
            failure_reason: None,
            last_error: None,
            created_at: task.created_at,
            processed_at: None,
            finished_at: None,
        };
        let seq = state.next_seq;
        state.tasks.insert(
            task.id,
            StoredTask {
                seq,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    async fn lease(
        &self,
        owner: &str,
        now: OffsetDateTime,
        visibility: Duration,
    ) -> Result<Option<RenderTaskRecord>, RepoError> {
        let mut state = self.state.lock().await;
        let next = state
            .tasks
            .values_mut()
            .filter(|task| task.is_ready() && task.record.run_at <= now)
            .min_by_key(|task| task.order_key());

        Ok(next.map(|task| {
            let record = &mut task.record;
            record.state = TaskState::Active;
            record.lease_owner = Some(owner.to_string());
            record.lease_expires_at = Some(now + visibility);
            record.processed_at = Some(now);
            record.progress = 0;
            record.clone()
        }))
    }

    async fn touch_progress(
        &self,
        id: &str,
        owner: &str,
        progress: u8,
        now: OffsetDateTime,
        visibility: Duration,
    ) -> Result<(), RepoError> {
        let mut state = self.state.lock().await;
        let record = state.leased_mut(id, owner)?;
        record.progress = progress.min(100);
        record.lease_expires_at = Some(now + visibility);
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: &str,
        owner: &str,
        result: &RenderResult,
        now: OffsetDateTime,
    ) -> Result<(), RepoError> {
        let mut state = self.state.lock().await;
        let record = state.leased_mut(id, owner)?;
        record.state = TaskState::Completed;
        record.progress = 100;
        record.result = Some(result.clone());
        record.finished_at = Some(now);
        release_lease(record);
        Ok(())
    }

    async fn record_failure(
        &self,
        id: &str,
        owner: &str,
        transition: &FailureTransition,
    ) -> Result<(), RepoError> {
        let mut state = self.state.lock().await;
        let record = state.leased_mut(id, owner)?;
        record.attempts_made = transition.attempts_made;
        record.last_error = Some(transition.reason.clone());

        match transition.retry_at {
            Some(retry_at) => {
                record.state = TaskState::Delayed;
                record.run_at = retry_at;
            }
            None => {
                record.state = TaskState::Failed;
                record.failure_reason = Some(transition.reason.clone());
                record.finished_at = Some(transition.now);
            }
        }
        release_lease(record);
        Ok(())
    }

    async fn reclaim_stalled(&self, now: OffsetDateTime) -> Result<Vec<StalledTask>, RepoError> {
        let mut state = self.state.lock().await;
        let mut reclaimed: Vec<(u64, StalledTask)> = Vec::new();

        for task in state.tasks.values_mut() {
            let record = &mut task.record;
            let expired = record.state == TaskState::Active
                && record.lease_expires_at.is_some_and(|deadline| deadline <= now);
            if !expired {
                continue;
            }

            record.attempts_made += 1;
            record.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
            record.run_at = now;
            release_lease(record);

            if record.attempts_made >= record.max_attempts {
                record.state = TaskState::Failed;
                record.failure_reason = Some(STALLED_FAILURE_REASON.to_string());
                record.finished_at = Some(now);
            } else {
                record.state = TaskState::Waiting;
            }

            reclaimed.push((
                task.seq,
                StalledTask {
                    id: record.id.clone(),
                    attempts_made: record.attempts_made,
                    max_attempts: record.max_attempts,
                    state: record.state,
                },
            ));
        }

        reclaimed.sort_by_key(|(seq, _)| *seq);
        Ok(reclaimed.into_iter().map(|(_, task)| task).collect())
    }

    async fn find(&self, id: &str) -> Result<Option<RenderTaskRecord>, RepoError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(id).map(|task| task.record.clone()))
    }

    async fn position(&self, id: &str, now: OffsetDateTime) -> Result<Option<u64>, RepoError> {
        let state = self.state.lock().await;
        let task = state.tasks.get(id).ok_or(RepoError::NotFound)?;
        if !task.is_ready() {
            return Ok(None);
        }

        let key = task.order_key();
        let ahead = state
            .tasks
            .values()
            .filter(|other| {
                other.is_ready() && other.record.run_at <= now && other.order_key() < key
            })
            .count();
        Ok(Some(ahead as u64 + 1))
    }

    async fn counts(&self) -> Result<QueueCounts, RepoError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for task in state.tasks.values() {
            match task.record.state {
                TaskState::Waiting => counts.waiting += 1,
                TaskState::Delayed => counts.delayed += 1,
                TaskState::Active => counts.active += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_finished(
        &self,
        state_filter: TaskState,
        finished_before: OffsetDateTime,
    ) -> Result<Vec<RenderTaskRecord>, RepoError> {
        if !state_filter.is_terminal() {
            return Err(RepoError::InvalidInput {
                message: format!("cannot purge tasks in `{}` state", state_filter.as_str()),
            });
        }

        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .tasks
            .values()
            .filter(|task| {
                task.record.state == state_filter
                    && task
                        .record
                        .finished_at
                        .is_some_and(|finished| finished < finished_before)
            })
            .map(|task| task.record.id.clone())
            .collect();

        Ok(expired
            .iter()
            .filter_map(|id| state.tasks.remove(id))
            .map(|task| task.record)
            .collect())
    }

    async fn ping(&self) -> Result<(), RepoError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value};

    use super::*;
    use crate::domain::entities::RenderPayload;

    const VISIBILITY: Duration = Duration::from_secs(60);

    fn new_task(id: &str, priority: i32, at: OffsetDateTime) -> NewTaskRecord {
        NewTaskRecord {
            id: id.to_string(),
            payload: RenderPayload {
                template: "invoice".to_string(),
                data: Map::new(),
                options: Value::Null,
            },
            priority,
            max_attempts: 3,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn leases_by_priority_then_insertion_order() {
        let store = MemoryTaskStore::new();
        let now = OffsetDateTime::now_utc();
        store.insert(new_task("low-1", 10, now)).await.unwrap();
        store.insert(new_task("high", 1, now)).await.unwrap();
        store.insert(new_task("low-2", 10, now)).await.unwrap();

        assert_eq!(store.position("low-2", now).await.unwrap(), Some(3));

        let mut order = Vec::new();
        while let Some(task) = store.lease("w", now, VISIBILITY).await.unwrap() {
            order.push(task.id);
        }
        assert_eq!(order, vec!["high", "low-1", "low-2"]);
        assert_eq!(store.position("high", now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = MemoryTaskStore::new();
        let now = OffsetDateTime::now_utc();
        store.insert(new_task("a", 0, now)).await.unwrap();
        assert!(matches!(
            store.insert(new_task("a", 0, now)).await,
            Err(RepoError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn transitions_require_current_lease_owner() {
        let store = MemoryTaskStore::new();
        let now = OffsetDateTime::now_utc();
        store.insert(new_task("a", 0, now)).await.unwrap();
        store.lease("owner-1", now, VISIBILITY).await.unwrap();

        let result = RenderResult {
            file_path: "output/a.pdf".to_string(),
            file_size: 10,
            duration_ms: 5,
            template: "invoice".to_string(),
        };
        assert!(matches!(
            store.mark_completed("a", "owner-2", &result, now).await,
            Err(RepoError::LeaseLost { .. })
        ));
        store.mark_completed("a", "owner-1", &result, now).await.unwrap();

        let record = store.find("a").await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Completed);
        assert_eq!(record.progress, 100);
        assert!(record.lease_owner.is_none());
    }

    #[tokio::test]
    async fn delayed_tasks_wait_for_their_run_at() {
        let store = MemoryTaskStore::new();
        let now = OffsetDateTime::now_utc();
        store.insert(new_task("a", 0, now)).await.unwrap();
        store.lease("w", now, VISIBILITY).await.unwrap();

        let retry_at = now + Duration::from_secs(2);
        store
            .record_failure(
                "a",
                "w",
                &FailureTransition {
                    attempts_made: 1,
                    reason: "engine crashed".to_string(),
                    retry_at: Some(retry_at),
                    now,
                },
            )
            .await
            .unwrap();

        assert!(store.lease("w", now, VISIBILITY).await.unwrap().is_none());

        store.insert(new_task("b", 0, now)).await.unwrap();
        assert_eq!(store.position("b", now).await.unwrap(), Some(1));
        assert_eq!(store.position("b", retry_at).await.unwrap(), Some(2));

        let again = store.lease("w", retry_at, VISIBILITY).await.unwrap().unwrap();
        assert_eq!(again.id, "a");
        assert_eq!(again.attempts_made, 1);
        assert_eq!(again.last_error.as_deref(), Some("engine crashed"));
    }

    #[tokio::test]
    async fn purge_only_removes_old_terminal_tasks() {
        let store = MemoryTaskStore::new();
        let now = OffsetDateTime::now_utc();
        store.insert(new_task("done", 0, now)).await.unwrap();
        store.insert(new_task("pending", 0, now)).await.unwrap();
        let leased = store.lease("w", now, VISIBILITY).await.unwrap().unwrap();
        assert_eq!(leased.id, "done");
        let result = RenderResult {
            file_path: "output/done.pdf".to_string(),
            file_size: 1,
            duration_ms: 1,
            template: "invoice".to_string(),
        };
        store.mark_completed("done", "w", &result, now).await.unwrap();

        let later = now + Duration::from_secs(3600);
        let purged = store.purge_finished(TaskState::Completed, later).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert!(store.find("done").await.unwrap().is_none());
        assert!(store.find("pending").await.unwrap().is_some());
        assert!(store.purge_finished(TaskState::Waiting, later).await.is_err());
    }
}
