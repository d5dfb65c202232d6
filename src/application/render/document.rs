use std::{sync::Arc, time::Duration};

use metrics::{counter, histogram};
use serde_json::{Map, Value};
use tokio::time::{Instant, timeout};
use tracing::{info, warn};

use crate::domain::entities::RenderPayload;

use super::{
    engine::{EnginePool, WaitCondition},
    types::{RenderError, RenderedDocument, TemplateError, TemplateRenderer},
};

pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Every PDF starts with this signature.
pub const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// Template -> HTML -> document, on one context borrowed from the engine pool.
pub struct DocumentRenderer {
    templates: Arc<dyn TemplateRenderer>,
    engine: Arc<EnginePool>,
    render_timeout: Duration,
}

impl DocumentRenderer {
    pub fn new(
        templates: Arc<dyn TemplateRenderer>,
        engine: Arc<EnginePool>,
        render_timeout: Duration,
    ) -> Self {
        Self {
            templates,
            engine,
            render_timeout,
        }
    }

    pub fn engine(&self) -> &Arc<EnginePool> {
        &self.engine
    }

    /// Render only the HTML stage.
    pub async fn render_html(
        &self,
        template: &str,
        data: &Map<String, Value>,
    ) -> Result<String, RenderError> {
        let templates = Arc::clone(&self.templates);
        let name = template.to_string();
        let data = data.clone();

        tokio::task::spawn_blocking(move || templates.render(&name, &data))
            .await
            .map_err(|err| RenderError::Aborted(err.to_string()))?
            .map_err(RenderError::from)
    }

    pub async fn template_source(&self, template: &str) -> Result<String, TemplateError> {
        let templates = Arc::clone(&self.templates);
        let name = template.to_string();

        tokio::task::spawn_blocking(move || templates.source(&name))
            .await
            .map_err(|err| TemplateError::Io(err.to_string()))?
    }

    /// Render the payload into document bytes. The context is always closed,
    /// whatever the outcome.
    pub async fn render_document(
        &self,
        payload: &RenderPayload,
    ) -> Result<RenderedDocument, RenderError> {
        let started = Instant::now();
        let result = self.render_inner(payload).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(bytes) => {
                counter!("docpress_render_total").increment(1);
                histogram!("docpress_render_ms").record(elapsed.as_secs_f64() * 1000.0);
                info!(
                    target = "application::render::document",
                    template = %payload.template,
                    bytes = bytes.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "document rendered"
                );
            }
            Err(err) => {
                counter!("docpress_render_failed_total").increment(1);
                warn!(
                    target = "application::render::document",
                    template = %payload.template,
                    error = %err,
                    "document render failed"
                );
            }
        }

        result.map(|bytes| RenderedDocument {
            bytes,
            duration: elapsed,
        })
    }

    async fn render_inner(&self, payload: &RenderPayload) -> Result<Vec<u8>, RenderError> {
        let html = self.render_html(&payload.template, &payload.data).await?;

        let mut context = self.engine.acquire_context().await?;
        let outcome = timeout(self.render_timeout, async {
            context
                .set_content(&html, WaitCondition::NetworkIdle)
                .await?;
            context.export_document(&payload.options).await
        })
        .await;
        self.engine.release_context(context).await;

        let bytes = match outcome {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(RenderError::Timeout(self.render_timeout)),
        };

        if bytes.is_empty() {
            return Err(RenderError::EmptyDocument);
        }
        Ok(bytes)
    }
}
