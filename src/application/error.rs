use std::error::Error as StdError;

use axum::{http::StatusCode, response::Response};
use thiserror::Error;

use crate::{
    application::{jobs::QueueError, render::RenderError},
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Error chain attached to a response so the logging middleware can report it.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Process-level failures surfaced by the binary's commands.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Exit code used by the binary when a command fails.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Validation(_) | AppError::Domain(DomainError::Validation { .. }) => 2,
            AppError::Infra(InfraError::Configuration { .. }) => 78,
            AppError::Queue(QueueError::BackendUnavailable { .. })
            | AppError::Infra(InfraError::Database { .. }) => 69,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_collects_source_chain() {
        let inner = std::io::Error::other("disk on fire");
        let outer = InfraError::from(inner);
        let report = ErrorReport::from_error("test", StatusCode::INTERNAL_SERVER_ERROR, &outer);
        assert!(!report.messages.is_empty());
        assert!(report.messages.iter().any(|m| m.contains("disk on fire")));
    }

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(AppError::validation("bad").exit_code(), 2);
        assert_eq!(
            AppError::from(QueueError::BackendUnavailable {
                message: "refused".to_string()
            })
            .exit_code(),
            69
        );
        assert_eq!(AppError::unexpected("boom").exit_code(), 1);
    }
}
