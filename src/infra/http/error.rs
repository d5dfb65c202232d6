use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::ErrorReport;
use crate::application::jobs::{QueueError, SYNC_FALLBACK_HINT};
use crate::application::render::{LimiterError, RenderError, TemplateError};
use crate::domain::error::DomainError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const DUPLICATE: &str = "duplicate";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const TASK_NOT_READY: &str = "task_not_ready";
    pub const TEMPLATE_NOT_FOUND: &str = "template_not_found";
    pub const TEMPLATE: &str = "template_error";
    pub const RENDER: &str = "render_error";
    pub const QUEUE_UNAVAILABLE: &str = "queue_unavailable";
    pub const QUEUE: &str = "queue_error";
    pub const OVERLOADED: &str = "overloaded";
    pub const OUTPUT: &str = "output_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn not_found(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, hint)
    }

    pub fn internal(code: &'static str, message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message, hint)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation { message } => Self::new(
                StatusCode::BAD_REQUEST,
                codes::INVALID_INPUT,
                "Invalid request",
                Some(message),
            ),
            DomainError::NotFound { entity } => {
                Self::not_found("Resource not found", Some(entity.to_string()))
            }
            DomainError::Invariant { message } => {
                Self::internal(codes::QUEUE, "Invariant violated", Some(message))
            }
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::BackendUnavailable { message } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::QUEUE_UNAVAILABLE,
                "Render queue unavailable",
                Some(format!("{SYNC_FALLBACK_HINT} ({message})")),
            ),
            QueueError::Duplicate { task_id } => Self::new(
                StatusCode::CONFLICT,
                codes::DUPLICATE,
                "Task already exists",
                Some(format!("task `{task_id}` is already queued")),
            ),
            QueueError::NotFound { task_id } => {
                Self::not_found("Task not found", Some(format!("no task `{task_id}`")))
            }
            QueueError::Invalid(err) => Self::from(err),
            other @ (QueueError::LeaseLost { .. } | QueueError::Store(_)) => {
                Self::internal(codes::QUEUE, "Render queue error", Some(other.to_string()))
            }
        }
    }
}

impl From<RenderError> for ApiError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::TemplateNotFound(template) => Self::new(
                StatusCode::NOT_FOUND,
                codes::TEMPLATE_NOT_FOUND,
                "Template not found",
                Some(format!("template `{template}` does not exist")),
            ),
            err @ RenderError::Template { .. } => Self::internal(
                codes::TEMPLATE,
                "Template failed to render",
                Some(err.to_string()),
            ),
            other => Self::internal(
                codes::RENDER,
                "Document rendering failed",
                Some(other.to_string()),
            ),
        }
    }
}

impl From<TemplateError> for ApiError {
    fn from(err: TemplateError) -> Self {
        Self::from(RenderError::from(err))
    }
}

impl From<LimiterError> for ApiError {
    fn from(err: LimiterError) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::OVERLOADED,
            "Synchronous render path unavailable",
            Some(err.to_string()),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let hint = self.hint.clone();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(
            "infra::http",
            self.status,
            format!("{}: {}", self.code, hint.as_deref().unwrap_or(self.message)),
        )
        .attach(&mut response);
        response
    }
}
