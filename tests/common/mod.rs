#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use docpress::application::jobs::{JobWorkerContext, QueuePolicy, RenderQueue};
use docpress::application::render::{
    DEFAULT_RENDER_TIMEOUT, DocumentRenderer, EngineContext, EngineError, EngineLauncher,
    EnginePool, EnginePoolSettings, EngineProcess, WaitCondition,
};
use docpress::infra::memory::MemoryTaskStore;
use docpress::infra::output::OutputStore;
use docpress::infra::templates::FsTemplateRenderer;

pub const INVOICE_TEMPLATE: &str = "<h1>{{ invoiceNumber }}</h1>\
{% for item in items %}<p>{{ item.name }} x {{ item.quantity }}</p>{% endfor %}";

/// Counters shared by every context a [`FakeLauncher`] hands out.
#[derive(Default)]
pub struct ExportGauge {
    pub renders: AtomicUsize,
    /// The next N exports fail with a crash.
    pub failing_exports: AtomicUsize,
    pub delay_ms: AtomicU64,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

/// Engine double producing a tiny, well-formed-looking PDF per render.
#[derive(Default)]
pub struct FakeLauncher {
    pub launches: AtomicUsize,
    pub gauge: Arc<ExportGauge>,
}

impl FakeLauncher {
    pub fn fail_next_exports(&self, count: usize) {
        self.gauge.failing_exports.store(count, Ordering::SeqCst);
    }

    /// Make every export take at least `delay`.
    pub fn slow_exports(&self, delay: Duration) {
        self.gauge
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn renders(&self) -> usize {
        self.gauge.renders.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.gauge.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn EngineProcess>, EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (disconnected, _) = watch::channel(false);
        Ok(Arc::new(FakeProcess {
            disconnected,
            gauge: Arc::clone(&self.gauge),
        }))
    }
}

struct FakeProcess {
    disconnected: watch::Sender<bool>,
    gauge: Arc<ExportGauge>,
}

#[async_trait]
impl EngineProcess for FakeProcess {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn new_context(&self) -> Result<Box<dyn EngineContext>, EngineError> {
        Ok(Box::new(FakeContext {
            html: String::new(),
            gauge: Arc::clone(&self.gauge),
        }))
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }

    async fn terminate(&self) {
        let _ = self.disconnected.send(true);
    }
}

struct FakeContext {
    html: String,
    gauge: Arc<ExportGauge>,
}

#[async_trait]
impl EngineContext for FakeContext {
    async fn set_content(&mut self, html: &str, _wait: WaitCondition) -> Result<(), EngineError> {
        self.html = html.to_string();
        Ok(())
    }

    async fn export_document(&mut self, _layout: &Value) -> Result<Vec<u8>, EngineError> {
        let gauge = &self.gauge;
        let should_fail = gauge
            .failing_exports
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(EngineError::Crashed("connection is closed".to_string()));
        }

        let running = gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = gauge.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        gauge.in_flight.fetch_sub(1, Ordering::SeqCst);

        gauge.renders.fetch_add(1, Ordering::SeqCst);
        Ok(format!("%PDF-1.7\n{}\n%%EOF\n", self.html).into_bytes())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// A queue, renderer and output directory wired to in-memory fakes.
pub struct Harness {
    pub store: Arc<MemoryTaskStore>,
    pub context: JobWorkerContext,
    pub launcher: Arc<FakeLauncher>,
    pub engine: Arc<EnginePool>,
    pub views: tempfile::TempDir,
    pub output_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(policy: QueuePolicy) -> Self {
        let views = tempfile::tempdir().expect("views dir");
        std::fs::write(views.path().join("invoice.html"), INVOICE_TEMPLATE)
            .expect("write invoice template");
        let output_dir = tempfile::tempdir().expect("output dir");

        let store = Arc::new(MemoryTaskStore::new());
        let queue = RenderQueue::new(store.clone(), policy);

        let launcher = Arc::new(FakeLauncher::default());
        let engine = Arc::new(EnginePool::new(
            launcher.clone(),
            EnginePoolSettings::default(),
        ));
        let templates = Arc::new(FsTemplateRenderer::new(
            views.path().to_path_buf(),
            "http://localhost:3000",
        ));
        let renderer = Arc::new(DocumentRenderer::new(
            templates,
            Arc::clone(&engine),
            DEFAULT_RENDER_TIMEOUT,
        ));
        let output =
            Arc::new(OutputStore::new(output_dir.path().to_path_buf()).expect("output store"));

        Self {
            store,
            context: JobWorkerContext {
                queue,
                renderer,
                output,
            },
            launcher,
            engine,
            views,
            output_dir,
        }
    }

    pub fn queue(&self) -> &RenderQueue {
        &self.context.queue
    }
}

pub fn invoice_data() -> serde_json::Map<String, Value> {
    match serde_json::json!({
        "invoiceNumber": "INV-001",
        "items": [
            {"name": "Widget", "quantity": 2, "price": 100},
            {"name": "Gadget", "quantity": 1, "price": 200}
        ]
    }) {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}
