//! HTTP surface: synchronous export, the async queue endpoints and health.

pub mod error;
mod handlers;
pub mod middleware;
pub mod models;

use std::{sync::Arc, time::Instant};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::{
    application::{
        jobs::RenderQueue,
        render::{ConcurrencyLimiter, DocumentRenderer},
    },
    infra::output::OutputStore,
};

use self::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct AppState {
    pub queue: RenderQueue,
    pub renderer: Arc<DocumentRenderer>,
    pub limiter: ConcurrencyLimiter,
    pub output: Arc<OutputStore>,
    pub delete_after_download: bool,
    pub started_at: Instant,
}

pub fn build_router(state: AppState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/pdf/export", post(handlers::export_pdf))
        .route("/pdf/preview", post(handlers::preview_html))
        .route("/pdf/templates/{name}", get(handlers::template_source))
        .route("/pdf/generate-async", post(handlers::generate_async))
        .route("/pdf/task/{task_id}", get(handlers::task_status))
        .route("/pdf/download/{task_id}", get(handlers::download))
        .route("/pdf/queue/status", get(handlers::queue_status))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
