use std::sync::Arc;

use apalis::prelude::Error as ApalisError;

use crate::{
    application::{jobs::queue::RenderQueue, render::DocumentRenderer},
    infra::output::OutputStore,
};

/// Shared context passed to render workers and scheduled jobs.
#[derive(Clone)]
pub struct JobWorkerContext {
    pub queue: RenderQueue,
    pub renderer: Arc<DocumentRenderer>,
    pub output: Arc<OutputStore>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into an [`ApalisError::Failed`].
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}
