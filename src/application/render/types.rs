use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use super::engine::EngineError;

/// Turns a named template plus data into an HTML document.
///
/// Implementations are synchronous; callers run them off the async executor.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, data: &Map<String, Value>) -> Result<String, TemplateError>;

    /// Raw template source, used by the template inspection endpoint.
    fn source(&self, template: &str) -> Result<String, TemplateError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template `{template}` not found")]
    NotFound { template: String },
    #[error("template `{template}` failed to render: {message}")]
    Render { template: String, message: String },
    #[error("template store unreadable: {0}")]
    Io(String),
}

/// A rendered document held in memory.
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub bytes: Vec<u8>,
    pub duration: Duration,
}

impl RenderedDocument {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("template `{0}` not found")]
    TemplateNotFound(String),
    #[error("template `{template}` failed to render: {message}")]
    Template { template: String, message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("render did not finish within {0:?}")]
    Timeout(Duration),
    #[error("render engine produced an empty document")]
    EmptyDocument,
    #[error("render task aborted: {0}")]
    Aborted(String),
}

impl RenderError {
    /// Errors that would fail the same way on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::TemplateNotFound(_) | Self::Template { .. })
    }
}

impl From<TemplateError> for RenderError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::NotFound { template } => Self::TemplateNotFound(template),
            TemplateError::Render { template, message } => Self::Template { template, message },
            TemplateError::Io(message) => Self::Aborted(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_errors_are_permanent_engine_errors_are_not() {
        let missing = RenderError::from(TemplateError::NotFound {
            template: "does-not-exist".to_string(),
        });
        assert!(missing.is_permanent());
        assert!(missing.to_string().contains("does-not-exist"));

        let crashed = RenderError::from(EngineError::Crashed("gone".to_string()));
        assert!(!crashed.is_permanent());
        assert!(!RenderError::Timeout(Duration::from_secs(30)).is_permanent());
        assert!(!RenderError::EmptyDocument.is_permanent());
    }
}
