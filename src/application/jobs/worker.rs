//! Render worker: an explicit lease -> execute -> report loop over the queue.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    application::{
        jobs::{
            context::JobWorkerContext,
            queue::{FailureOutcome, Lease, LeasedTask, QueueError, TaskFailure},
        },
        render::RenderError,
    },
    domain::entities::RenderResult,
    infra::output::OutputStoreError,
};

pub const DEFAULT_WORKER_CONCURRENCY: usize = 5;

pub const PROGRESS_ACCEPTED: u8 = 10;
pub const PROGRESS_RENDERING: u8 = 30;
pub const PROGRESS_PERSISTING: u8 = 90;
pub const PROGRESS_DONE: u8 = 100;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Tasks processed concurrently by one worker.
    pub concurrency: usize,
    /// Sleep between lease attempts when the queue is empty.
    pub poll_interval: Duration,
    pub stalled_check_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(500),
            stalled_check_interval: Duration::from_secs(30),
        }
    }
}

/// How one leased task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(RenderResult),
    Failed(FailureOutcome),
    /// The lease was taken over (stalled and reclaimed) before we reported.
    Abandoned,
}

pub struct RenderWorker {
    id: String,
    context: JobWorkerContext,
    settings: WorkerSettings,
}

impl RenderWorker {
    pub fn new(id: impl Into<String>, context: JobWorkerContext, settings: WorkerSettings) -> Self {
        Self {
            id: id.into(),
            context,
            settings,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender goes away), then
    /// wait for in-flight tasks to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let width = self.settings.concurrency.max(1);
        let slots = Arc::new(Semaphore::new(width));
        let sweeper = self.spawn_stalled_sweeper(shutdown.clone());

        info!(
            target = "application::jobs::worker",
            worker_id = %self.id,
            concurrency = width,
            "render worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.context.queue.lease(&self.id).await {
                Ok(Some(leased)) => {
                    let context = self.context.clone();
                    let span = info_span!(
                        "render_task",
                        task_id = %leased.lease.task_id,
                        worker_id = %self.id
                    );
                    tokio::spawn(
                        async move {
                            process_render_task(&context, leased).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    idle(self.settings.poll_interval, &mut shutdown).await;
                }
                Err(err) => {
                    drop(permit);
                    warn!(
                        target = "application::jobs::worker",
                        worker_id = %self.id,
                        error = %err,
                        "lease attempt failed"
                    );
                    idle(self.settings.poll_interval, &mut shutdown).await;
                }
            }
        }

        info!(
            target = "application::jobs::worker",
            worker_id = %self.id,
            "render worker draining in-flight tasks"
        );
        let width = u32::try_from(width).unwrap_or(u32::MAX);
        let _ = slots.acquire_many(width).await;
        sweeper.abort();
        info!(
            target = "application::jobs::worker",
            worker_id = %self.id,
            "render worker stopped"
        );
    }

    fn spawn_stalled_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.context.queue.clone();
        let interval = self.settings.stalled_check_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }
                if let Err(err) = queue.reclaim_stalled().await {
                    warn!(
                        target = "application::jobs::worker",
                        error = %err,
                        "stalled task sweep failed"
                    );
                }
            }
        })
    }
}

async fn idle(interval: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = sleep(interval) => {}
        _ = shutdown.changed() => {}
    }
}

/// Execute one leased task and report its outcome to the queue.
///
/// Every failure of the render sequence ends in `fail`; nothing is marked
/// complete until the output was re-read from disk.
pub async fn process_render_task(context: &JobWorkerContext, leased: LeasedTask) -> TaskOutcome {
    let lease = leased.lease.clone();

    let result = match execute(context, &leased).await {
        Ok(result) => result,
        Err(failure) => return report_failure(context, &lease, failure).await,
    };

    match context.queue.complete(&lease, &result).await {
        Ok(()) => {
            info!(
                target = "application::jobs::worker",
                task_id = %lease.task_id,
                file_size = result.file_size,
                duration_ms = result.duration_ms,
                "render task completed"
            );
            TaskOutcome::Completed(result)
        }
        Err(QueueError::LeaseLost { .. }) => {
            warn!(
                target = "application::jobs::worker",
                task_id = %lease.task_id,
                "lease expired before completion could be recorded"
            );
            TaskOutcome::Abandoned
        }
        Err(err) => {
            // The lease will expire and the stalled sweep retries the task.
            error!(
                target = "application::jobs::worker",
                task_id = %lease.task_id,
                error = %err,
                "failed to record task completion"
            );
            TaskOutcome::Abandoned
        }
    }
}

async fn execute(
    context: &JobWorkerContext,
    leased: &LeasedTask,
) -> Result<RenderResult, TaskFailure> {
    let started = Instant::now();
    let lease = &leased.lease;
    let payload = &leased.record.payload;

    progress(context, lease, PROGRESS_ACCEPTED).await;
    context
        .output
        .path_for(&lease.task_id)
        .map_err(|err| TaskFailure::permanent(err.to_string()))?;

    progress(context, lease, PROGRESS_RENDERING).await;
    let document = context
        .renderer
        .render_document(payload)
        .await
        .map_err(render_failure)?;

    progress(context, lease, PROGRESS_PERSISTING).await;
    context
        .output
        .write(&lease.task_id, &document.bytes)
        .await
        .map_err(output_failure)?;
    let stored = context
        .output
        .verify(&lease.task_id, document.len() as u64)
        .await
        .map_err(output_failure)?;

    progress(context, lease, PROGRESS_DONE).await;

    Ok(RenderResult {
        file_path: stored.path.display().to_string(),
        file_size: stored.size,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        template: payload.template.clone(),
    })
}

async fn progress(context: &JobWorkerContext, lease: &Lease, percent: u8) {
    if let Err(err) = context.queue.report_progress(lease, percent).await {
        debug!(
            target = "application::jobs::worker",
            task_id = %lease.task_id,
            percent,
            error = %err,
            "progress update not recorded"
        );
    }
}

fn render_failure(err: RenderError) -> TaskFailure {
    if err.is_permanent() {
        TaskFailure::permanent(err.to_string())
    } else {
        TaskFailure::retryable(err.to_string())
    }
}

fn output_failure(err: OutputStoreError) -> TaskFailure {
    match err {
        OutputStoreError::InvalidKey(_) => TaskFailure::permanent(err.to_string()),
        other => TaskFailure::retryable(format!("failed to persist output: {other}")),
    }
}

async fn report_failure(
    context: &JobWorkerContext,
    lease: &Lease,
    failure: TaskFailure,
) -> TaskOutcome {
    match context.queue.fail(lease, &failure).await {
        Ok(outcome) => TaskOutcome::Failed(outcome),
        Err(QueueError::LeaseLost { .. }) => TaskOutcome::Abandoned,
        Err(err) => {
            error!(
                target = "application::jobs::worker",
                task_id = %lease.task_id,
                error = %err,
                reason = %failure.reason,
                "failed to record task failure"
            );
            TaskOutcome::Abandoned
        }
    }
}
