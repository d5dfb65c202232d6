mod context;
mod queue;
mod retention;
mod status;
mod worker;

pub use context::{JobWorkerContext, job_failed};
pub use queue::{
    EnqueueRequest, EnqueuedTask, FailureOutcome, Lease, LeasedTask, PurgeReport, QueueError,
    QueueHealth, QueuePolicy, RenderQueue, SYNC_FALLBACK_HINT, TaskFailure,
};
pub use retention::{
    DEFAULT_RETENTION_SCHEDULE, RetentionJob, process_retention_job, retention_schedule,
    run_retention,
};
pub use status::{ResultSummary, TaskView};
pub use worker::{
    DEFAULT_WORKER_CONCURRENCY, PROGRESS_ACCEPTED, PROGRESS_DONE, PROGRESS_PERSISTING,
    PROGRESS_RENDERING, RenderWorker, TaskOutcome, WorkerSettings, process_render_task,
};
