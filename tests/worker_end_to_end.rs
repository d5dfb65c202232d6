mod common;

use std::{sync::atomic::Ordering, time::Duration};

use docpress::application::jobs::{
    EnqueueRequest, FailureOutcome, QueuePolicy, RenderWorker, TaskOutcome, WorkerSettings,
    process_render_task,
};
use docpress::application::render::PDF_SIGNATURE;
use docpress::domain::entities::RenderPayload;
use docpress::domain::types::{TaskState, TaskStatus};
use tokio::sync::watch;

use common::{Harness, invoice_data};

fn request(template: &str) -> EnqueueRequest {
    EnqueueRequest {
        task_id: None,
        payload: RenderPayload {
            template: template.to_string(),
            data: invoice_data(),
            options: serde_json::Value::Null,
        },
        priority: None,
        max_attempts: None,
    }
}

#[tokio::test]
async fn invoice_task_completes_with_verified_output() {
    let harness = Harness::new(QueuePolicy::default());
    let queue = harness.queue();
    let task = queue.enqueue(request("invoice")).await.expect("enqueued");

    let leased = queue.lease("w1").await.expect("lease").expect("ready task");
    let outcome = process_render_task(&harness.context, leased).await;

    let TaskOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert!(result.file_size > 0);
    assert_eq!(result.template, "invoice");

    let bytes = harness
        .context
        .output
        .read(&task.task_id)
        .await
        .expect("output readable");
    assert!(bytes.starts_with(PDF_SIGNATURE));
    assert_eq!(bytes.len() as u64, result.file_size);
    assert!(String::from_utf8_lossy(&bytes).contains("INV-001"));

    let view = queue.status(&task.task_id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.progress, 100);
    let summary = view.result.expect("result summary");
    assert_eq!(summary.file_size, result.file_size);
    assert!(view.finished_at.is_some());
}

#[tokio::test]
async fn missing_template_fails_without_retrying() {
    let harness = Harness::new(QueuePolicy::default());
    let queue = harness.queue();
    let task = queue
        .enqueue(request("does-not-exist"))
        .await
        .expect("enqueued");

    let leased = queue.lease("w1").await.expect("lease").expect("ready task");
    let outcome = process_render_task(&harness.context, leased).await;
    assert_eq!(
        outcome,
        TaskOutcome::Failed(FailureOutcome::Failed { attempts_made: 1 })
    );

    let view = queue.status(&task.task_id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Failed);
    let error = view.error.expect("failure reason");
    assert!(error.contains("does-not-exist"), "unexpected error: {error}");
    assert!(
        harness
            .context
            .output
            .read(&task.task_id)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn engine_crash_schedules_a_retry() {
    let harness = Harness::new(QueuePolicy::default());
    let queue = harness.queue();
    let task = queue.enqueue(request("invoice")).await.expect("enqueued");
    harness.launcher.fail_next_exports(1);

    let leased = queue.lease("w1").await.expect("lease").expect("ready task");
    let outcome = process_render_task(&harness.context, leased).await;
    assert!(matches!(
        outcome,
        TaskOutcome::Failed(FailureOutcome::Retrying {
            attempts_made: 1,
            ..
        })
    ));

    let record = queue.find(&task.task_id).await.expect("record");
    assert_eq!(record.state, TaskState::Delayed);
    assert!(record.last_error.is_some());
    assert!(record.result.is_none());
}

#[tokio::test]
async fn worker_loop_drains_the_queue_then_stops() {
    let harness = Harness::new(QueuePolicy::default());
    let queue = harness.queue();

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(queue.enqueue(request("invoice")).await.expect("enqueued").task_id);
    }

    let worker = RenderWorker::new(
        "test-worker",
        harness.context.clone(),
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            ..WorkerSettings::default()
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    for id in &ids {
        let record = queue
            .wait_for_terminal(id, Duration::from_secs(10))
            .await
            .expect("task found");
        assert_eq!(record.state, TaskState::Completed, "task {id}");
    }

    shutdown_tx.send(true).expect("worker listening");
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stopped")
        .expect("worker task joined");

    assert_eq!(harness.launcher.renders(), ids.len());
    assert_eq!(harness.launcher.launches.load(Ordering::SeqCst), 1);
}

async fn stop(shutdown: watch::Sender<bool>, handle: tokio::task::JoinHandle<()>) {
    shutdown.send(true).expect("worker listening");
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stopped")
        .expect("worker task joined");
}

#[tokio::test]
async fn worker_never_exceeds_its_concurrency() {
    let harness = Harness::new(QueuePolicy::default());
    harness.launcher.slow_exports(Duration::from_millis(50));
    let queue = harness.queue();

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(queue.enqueue(request("invoice")).await.expect("enqueued").task_id);
    }

    let worker = RenderWorker::new(
        "bounded-worker",
        harness.context.clone(),
        WorkerSettings {
            concurrency: 5,
            poll_interval: Duration::from_millis(5),
            ..WorkerSettings::default()
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    for id in &ids {
        let record = queue
            .wait_for_terminal(id, Duration::from_secs(20))
            .await
            .expect("task found");
        assert_eq!(record.state, TaskState::Completed, "task {id}");
    }
    stop(shutdown_tx, handle).await;

    let peak = harness.launcher.peak_in_flight();
    assert!(peak <= 5, "{peak} renders overlapped");
    assert!(peak >= 2, "renders never overlapped");
    assert_eq!(harness.launcher.renders(), ids.len());
}

#[tokio::test]
async fn worker_sweep_requeues_an_abandoned_lease() {
    let policy = QueuePolicy {
        visibility_timeout: Duration::from_millis(200),
        ..QueuePolicy::default()
    };
    let harness = Harness::new(policy);
    let queue = harness.queue();
    let task = queue.enqueue(request("invoice")).await.expect("enqueued");

    // Leased by a worker that disappears without reporting.
    let abandoned = queue.lease("gone").await.expect("lease").expect("ready task");
    assert_eq!(abandoned.record.state, TaskState::Active);

    let worker = RenderWorker::new(
        "sweeping-worker",
        harness.context.clone(),
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            stalled_check_interval: Duration::from_millis(50),
            ..WorkerSettings::default()
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    let record = queue
        .wait_for_terminal(&task.task_id, Duration::from_secs(10))
        .await
        .expect("task found");
    stop(shutdown_tx, handle).await;

    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.attempts_made, 1, "the stalled lease counts an attempt");
    assert_eq!(harness.launcher.renders(), 1);
}
