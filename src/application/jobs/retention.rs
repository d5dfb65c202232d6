//! Cron job purging finished tasks past their retention window, together
//! with their output files.

use std::str::FromStr;

use apalis::prelude::*;
use apalis_cron::Schedule;

use crate::{
    application::jobs::{
        context::{JobWorkerContext, job_failed},
        queue::{PurgeReport, QueueError},
    },
    domain::entities::RenderTaskRecord,
};

/// Daily at 02:00 UTC.
pub const DEFAULT_RETENTION_SCHEDULE: &str = "0 0 2 * * *";

/// Marker struct for the cron-triggered retention job.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct RetentionJob;

impl From<chrono::DateTime<chrono::Utc>> for RetentionJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

pub async fn process_retention_job(
    _job: RetentionJob,
    ctx: Data<JobWorkerContext>,
) -> Result<(), apalis::prelude::Error> {
    run_retention(&ctx).await.map(|_| ()).map_err(job_failed)
}

/// Purge expired tasks and delete the documents they left behind.
pub async fn run_retention(ctx: &JobWorkerContext) -> Result<PurgeReport, QueueError> {
    let report = ctx.queue.purge_expired().await?;

    let mut files_removed = 0usize;
    for record in report.completed.iter().chain(report.failed.iter()) {
        if remove_output(ctx, record).await {
            files_removed += 1;
        }
    }

    if report.total() > 0 {
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            files_removed,
            "Purged expired render tasks"
        );
    }
    Ok(report)
}

async fn remove_output(ctx: &JobWorkerContext, record: &RenderTaskRecord) -> bool {
    match ctx.output.remove(&record.id).await {
        Ok(removed) => removed,
        Err(err) => {
            tracing::warn!(task_id = %record.id, error = %err, "Failed to remove expired output");
            false
        }
    }
}

/// Parse the retention cron expression (seconds-first, six or seven fields).
pub fn retention_schedule(expression: &str) -> Result<Schedule, String> {
    Schedule::from_str(expression)
        .map_err(|err| format!("invalid cron expression `{expression}`: {err}"))
}
