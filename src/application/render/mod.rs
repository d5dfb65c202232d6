//! Document rendering: engine pool, synchronous-path admission and the
//! template -> document pipeline.
//!
//! The pipeline itself is stateless. Task bookkeeping (progress, outcomes)
//! happens in the caller, either the HTTP handler or a queue worker.

mod document;
mod engine;
mod limiter;
mod types;

pub use document::{DEFAULT_RENDER_TIMEOUT, DocumentRenderer, PDF_SIGNATURE};
pub use engine::{
    DEFAULT_RECYCLE_THRESHOLD, EngineContext, EngineError, EngineInstance, EngineLauncher,
    EnginePool, EnginePoolSettings, EngineProcess, EngineSnapshot, LifecycleState,
    RenderingContext, WaitCondition,
};
pub use limiter::{ConcurrencyLimiter, DEFAULT_SYNC_CONCURRENCY, LimiterError};
pub use types::{RenderError, RenderedDocument, TemplateError, TemplateRenderer};
