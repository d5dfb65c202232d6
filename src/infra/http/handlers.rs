use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use bytes::Bytes;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use crate::application::jobs::{EnqueueRequest, TaskView};
use crate::domain::entities::RenderPayload;
use crate::domain::identifiers::{validate_task_id, validate_template_name};
use crate::domain::types::TaskState;
use crate::infra::output::OutputStoreError;

use super::AppState;
use super::error::{ApiError, codes};
use super::models::{
    ENDPOINTS, EndpointInfo, EnqueueResponse, HealthResponse, RenderRequest, ServiceIndex,
    SyncHealth,
};

const PDF_CONTENT_TYPE: &str = "application/pdf";

pub async fn index() -> Json<ServiceIndex> {
    Json(ServiceIndex {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        endpoints: ENDPOINTS
            .iter()
            .map(|&(method, path, description)| EndpointInfo {
                method,
                path,
                description,
            })
            .collect(),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = state.renderer.engine().snapshot().await;
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();

    Json(HealthResponse {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
        timestamp,
        engine: engine.into(),
        sync: SyncHealth {
            in_flight: state.limiter.in_flight(),
            queued: state.limiter.queued(),
            limit: state.limiter.limit(),
        },
    })
}

/// Synchronous render. The document never touches disk.
pub async fn export_pdf(
    State(state): State<AppState>,
    body: Result<Json<RenderRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = parse_body(body)?;
    let payload = RenderPayload::parse(request.template, request.data, request.options)?;
    let template = payload.template.clone();

    let renderer = Arc::clone(&state.renderer);
    let document = state
        .limiter
        .run(async move { renderer.render_document(&payload).await })
        .await??;

    info!(
        target = "docpress::http::export",
        template = %template,
        bytes = document.len(),
        duration_ms = document.duration_ms(),
        "synchronous export finished"
    );

    Ok(pdf_response(
        Bytes::from(document.bytes),
        format!("inline; filename=\"{template}.pdf\""),
    ))
}

pub async fn preview_html(
    State(state): State<AppState>,
    body: Result<Json<RenderRequest>, JsonRejection>,
) -> Result<Html<String>, ApiError> {
    let request = parse_body(body)?;
    let payload = RenderPayload::parse(request.template, request.data, request.options)?;
    let html = state
        .renderer
        .render_html(&payload.template, &payload.data)
        .await?;
    Ok(Html(html))
}

pub async fn template_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    validate_template_name(&name).map_err(|err| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_INPUT,
            "Invalid template name",
            Some(err.to_string()),
        )
    })?;
    let source = state.renderer.template_source(&name).await?;

    let mut response = source.into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Ok(response)
}

pub async fn generate_async(
    State(state): State<AppState>,
    body: Result<Json<RenderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let request = parse_body(body)?;
    let payload = RenderPayload::parse(request.template, request.data, request.options)?;

    let enqueued = state
        .queue
        .enqueue(EnqueueRequest {
            task_id: request.task_id,
            payload,
            priority: request.priority,
            max_attempts: request.max_attempts,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse::queued(
            enqueued.task_id,
            enqueued.queue_position,
        )),
    ))
}

pub async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    check_task_id(&task_id)?;
    Ok(Json(state.queue.status(&task_id).await?))
}

pub async fn download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    check_task_id(&task_id)?;
    let record = state.queue.find(&task_id).await?;

    if record.state != TaskState::Completed {
        let view = TaskView::from_record(&record);
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::TASK_NOT_READY,
            "Task is not completed",
            Some(format!("task status is `{}`", view.status.as_str())),
        ));
    }

    let bytes = state.output.read(&task_id).await.map_err(|err| match err {
        OutputStoreError::NotFound(_) => ApiError::not_found(
            "Document not found",
            Some("the output was removed by retention cleanup".to_string()),
        ),
        other => ApiError::internal(
            codes::OUTPUT,
            "Failed to read document",
            Some(other.to_string()),
        ),
    })?;

    if state.delete_after_download {
        if let Err(err) = state.output.remove(&task_id).await {
            warn!(
                target = "docpress::http::download",
                task_id = %task_id,
                error = %err,
                "failed to remove downloaded output"
            );
        }
    }

    Ok(pdf_response(
        bytes,
        format!("attachment; filename=\"{task_id}.pdf\""),
    ))
}

pub async fn queue_status(State(state): State<AppState>) -> Response {
    let health = state.queue.health().await;
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("Route not found", None)
}

fn parse_body(body: Result<Json<RenderRequest>, JsonRejection>) -> Result<RenderRequest, ApiError> {
    body.map(|Json(request)| request).map_err(|rejection| {
        ApiError::bad_request("Malformed request body", Some(rejection.body_text()))
    })
}

fn check_task_id(task_id: &str) -> Result<(), ApiError> {
    validate_task_id(task_id).map_err(|err| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_INPUT,
            "Invalid task id",
            Some(err.to_string()),
        )
    })
}

fn pdf_response(bytes: Bytes, disposition: String) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(PDF_CONTENT_TYPE));
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}
