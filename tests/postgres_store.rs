//! Postgres-backed queue store. Needs `DATABASE_URL`; run with `--ignored`.

use std::{collections::HashSet, time::Duration};

use serde_json::{Map, Value};
use sqlx::PgPool;
use time::OffsetDateTime;

use docpress::application::repos::{
    FailureTransition, NewTaskRecord, RepoError, STALLED_FAILURE_REASON, TaskStore,
};
use docpress::domain::entities::{RenderPayload, RenderResult};
use docpress::domain::types::TaskState;
use docpress::infra::db::PostgresTaskStore;

const VISIBILITY: Duration = Duration::from_secs(60);

fn new_task(id: &str, priority: i32, max_attempts: i32, at: OffsetDateTime) -> NewTaskRecord {
    NewTaskRecord {
        id: id.to_string(),
        payload: RenderPayload {
            template: "invoice".to_string(),
            data: Map::new(),
            options: Value::Null,
        },
        priority,
        max_attempts,
        created_at: at,
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a running Postgres (DATABASE_URL)"]
async fn render_task_indexes_exist(pool: PgPool) {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT indexname FROM pg_indexes WHERE schemaname = 'public' AND tablename = 'render_tasks'",
    )
    .fetch_all(&pool)
    .await
    .expect("fetch render task indexes");

    let indexes: HashSet<String> = rows.into_iter().collect();
    for expected in [
        "render_tasks_ready_idx",
        "render_tasks_lease_idx",
        "render_tasks_finished_idx",
    ] {
        assert!(indexes.contains(expected), "missing {expected}");
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a running Postgres (DATABASE_URL)"]
async fn leases_follow_priority_and_reject_stale_owners(pool: PgPool) {
    let store = PostgresTaskStore::new(pool);
    let now = OffsetDateTime::now_utc();
    store.insert(new_task("low", 10, 3, now)).await.expect("insert");
    store.insert(new_task("high", 1, 3, now)).await.expect("insert");
    assert!(matches!(
        store.insert(new_task("high", 1, 3, now)).await,
        Err(RepoError::Duplicate { .. })
    ));
    assert_eq!(store.position("low", now).await.expect("position"), Some(2));

    let leased = store
        .lease("owner-1", now, VISIBILITY)
        .await
        .expect("lease")
        .expect("ready task");
    assert_eq!(leased.id, "high");
    assert_eq!(leased.state, TaskState::Active);

    let result = RenderResult {
        file_path: "output/high.pdf".to_string(),
        file_size: 10,
        duration_ms: 5,
        template: "invoice".to_string(),
    };
    assert!(matches!(
        store.mark_completed("high", "owner-2", &result, now).await,
        Err(RepoError::LeaseLost { .. })
    ));
    store
        .mark_completed("high", "owner-1", &result, now)
        .await
        .expect("completed");

    let record = store.find("high").await.expect("find").expect("record");
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.result, Some(result));
    assert_eq!(record.progress, 100);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a running Postgres (DATABASE_URL)"]
async fn delayed_retry_and_stalled_reclaim(pool: PgPool) {
    let store = PostgresTaskStore::new(pool);
    let now = OffsetDateTime::now_utc();
    store.insert(new_task("a", 0, 2, now)).await.expect("insert");

    store.lease("w1", now, VISIBILITY).await.expect("lease");
    let retry_at = now + Duration::from_secs(2);
    store
        .record_failure(
            "a",
            "w1",
            &FailureTransition {
                attempts_made: 1,
                reason: "engine crashed".to_string(),
                retry_at: Some(retry_at),
                now,
            },
        )
        .await
        .expect("failure recorded");
    assert!(store.lease("w2", now, VISIBILITY).await.expect("lease").is_none());

    let later = retry_at + Duration::from_millis(1);
    store
        .lease("w2", later, VISIBILITY)
        .await
        .expect("lease")
        .expect("retry ready");

    let expired = later + Duration::from_secs(61);
    let stalled = store.reclaim_stalled(expired).await.expect("sweep");
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].state, TaskState::Failed);
    assert_eq!(stalled[0].attempts_made, 2);

    let record = store.find("a").await.expect("find").expect("record");
    assert_eq!(record.failure_reason.as_deref(), Some(STALLED_FAILURE_REASON));

    let purged = store
        .purge_finished(TaskState::Failed, expired + Duration::from_secs(1))
        .await
        .expect("purge");
    assert_eq!(purged.len(), 1);
    assert!(store.find("a").await.expect("find").is_none());
}
