//! Render engine pool: owns the headless engine process and hands out
//! isolated rendering contexts.
//!
//! Exactly one instance is "current". It lives in a single slot guarded by an
//! async mutex; launching, recycling and crash-invalidation all go through that
//! slot, so no caller can be handed a context from a draining instance.

use std::{
    fmt,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{Mutex, watch},
    time::{Instant, timeout},
};
use tracing::{debug, info, warn};

pub const DEFAULT_RECYCLE_THRESHOLD: u64 = 5000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("render engine unavailable: {0}")]
    Unavailable(String),
    #[error("render engine crashed: {0}")]
    Crashed(String),
    #[error("render engine operation failed: {0}")]
    Operation(String),
}

/// Condition a context waits for after content has been loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// The page finished loading and has no outstanding network activity.
    NetworkIdle,
    /// The load event fired.
    Load,
}

/// Starts engine processes.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn EngineProcess>, EngineError>;
}

/// Handle to one running engine process.
#[async_trait]
pub trait EngineProcess: Send + Sync {
    /// Resolve once the process answers requests.
    async fn ping(&self) -> Result<(), EngineError>;

    async fn new_context(&self) -> Result<Box<dyn EngineContext>, EngineError>;

    /// Flips to `true` once when the process goes away.
    fn disconnected(&self) -> watch::Receiver<bool>;

    async fn terminate(&self);
}

/// One isolated rendering context ("page") inside an engine process.
#[async_trait]
pub trait EngineContext: Send {
    async fn set_content(&mut self, html: &str, wait: WaitCondition) -> Result<(), EngineError>;

    async fn export_document(&mut self, layout: &Value) -> Result<Vec<u8>, EngineError>;

    async fn close(&mut self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Starting,
    Ready,
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub struct EnginePoolSettings {
    /// Contexts an instance may issue before it is replaced.
    pub recycle_threshold: u64,
    pub startup_timeout: Duration,
    /// Quiet period after a failed replacement launch before the next attempt.
    pub relaunch_backoff: Duration,
}

impl Default for EnginePoolSettings {
    fn default() -> Self {
        Self {
            recycle_threshold: DEFAULT_RECYCLE_THRESHOLD,
            startup_timeout: Duration::from_secs(30),
            relaunch_backoff: Duration::from_secs(5),
        }
    }
}

pub struct EngineInstance {
    id: u64,
    process: Arc<dyn EngineProcess>,
    renders_served: AtomicU64,
    crashed: AtomicBool,
    state: StdMutex<LifecycleState>,
    open_contexts: watch::Sender<usize>,
}

impl fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineInstance")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("renders_served", &self.renders_served())
            .field("open_contexts", &self.open_contexts())
            .finish()
    }
}

impl EngineInstance {
    fn new(id: u64, process: Arc<dyn EngineProcess>) -> Self {
        let (open_contexts, _) = watch::channel(0);
        Self {
            id,
            process,
            renders_served: AtomicU64::new(0),
            crashed: AtomicBool::new(false),
            state: StdMutex::new(LifecycleState::Starting),
            open_contexts,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: LifecycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn renders_served(&self) -> u64 {
        self.renders_served.load(Ordering::Acquire)
    }

    pub fn open_contexts(&self) -> usize {
        *self.open_contexts.borrow()
    }

    fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    fn context_opened(&self) {
        self.renders_served.fetch_add(1, Ordering::AcqRel);
        self.open_contexts.send_modify(|open| *open += 1);
    }

    fn context_closed(&self) {
        self.open_contexts
            .send_modify(|open| *open = open.saturating_sub(1));
    }

    /// Errors raised by a context of a crashed instance surface as `Crashed`.
    fn classify(&self, err: EngineError) -> EngineError {
        match err {
            EngineError::Crashed(_) => err,
            other if self.is_crashed() => EngineError::Crashed(format!(
                "engine instance {} went away: {other}",
                self.id
            )),
            other => other,
        }
    }

    async fn shutdown(&self) {
        self.set_state(LifecycleState::Closed);
        self.process.terminate().await;
    }
}

/// Point-in-time view of the pool for health reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub instance_id: Option<u64>,
    pub state: Option<LifecycleState>,
    pub renders_served: u64,
    pub open_contexts: usize,
    pub recycle_threshold: u64,
}

type CurrentSlot = Arc<Mutex<Option<Arc<EngineInstance>>>>;

pub struct EnginePool {
    launcher: Arc<dyn EngineLauncher>,
    settings: EnginePoolSettings,
    current: CurrentSlot,
    next_id: AtomicU64,
    relaunch_after: StdMutex<Option<Instant>>,
}

impl EnginePool {
    pub fn new(launcher: Arc<dyn EngineLauncher>, settings: EnginePoolSettings) -> Self {
        Self {
            launcher,
            settings,
            current: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            relaunch_after: StdMutex::new(None),
        }
    }

    /// Open a context on the current instance, launching or recycling it first
    /// when needed.
    pub async fn acquire_context(&self) -> Result<RenderingContext, EngineError> {
        let instance = self.checkout().await?;

        match instance.process.new_context().await {
            Ok(inner) => Ok(RenderingContext {
                instance,
                inner: Some(inner),
            }),
            Err(err) => {
                instance.context_closed();
                Err(instance.classify(err))
            }
        }
    }

    /// Close a context. Never fails; a dead process just means nothing to close.
    pub async fn release_context(&self, context: RenderingContext) {
        context.close().await;
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(instance) => EngineSnapshot {
                instance_id: Some(instance.id),
                state: Some(instance.state()),
                renders_served: instance.renders_served(),
                open_contexts: instance.open_contexts(),
                recycle_threshold: self.settings.recycle_threshold,
            },
            None => EngineSnapshot {
                instance_id: None,
                state: None,
                renders_served: 0,
                open_contexts: 0,
                recycle_threshold: self.settings.recycle_threshold,
            },
        }
    }

    /// Terminate the current instance; the next acquire launches a new one.
    pub async fn shutdown(&self) {
        let instance = self.current.lock().await.take();
        if let Some(instance) = instance {
            info!(
                target = "application::render::engine",
                instance_id = instance.id,
                "shutting down render engine"
            );
            instance.shutdown().await;
        }
    }

    async fn checkout(&self) -> Result<Arc<EngineInstance>, EngineError> {
        let mut current = self.current.lock().await;

        let existing = current
            .as_ref()
            .filter(|instance| instance.state() == LifecycleState::Ready)
            .cloned();

        let instance = match existing {
            Some(existing) if existing.renders_served() >= self.settings.recycle_threshold => {
                self.recycle_locked(&mut current, existing).await
            }
            Some(existing) => existing,
            None => {
                let fresh = self.launch().await?;
                *current = Some(Arc::clone(&fresh));
                fresh
            }
        };

        // Counted while the slot is locked so a concurrent recycle observes it.
        instance.context_opened();
        Ok(instance)
    }

    /// Replace `old` with a fresh instance. The old instance drains and is
    /// terminated once its last context closes. A failed launch keeps `old`
    /// serving and holds off further attempts for `relaunch_backoff`.
    async fn recycle_locked(
        &self,
        current: &mut Option<Arc<EngineInstance>>,
        old: Arc<EngineInstance>,
    ) -> Arc<EngineInstance> {
        let mut relaunch_after = *self
            .relaunch_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if relaunch_after.is_some_and(|at| Instant::now() < at) {
            return old;
        }

        let launched = self.launch().await;
        relaunch_after = launched
            .is_err()
            .then(|| Instant::now() + self.settings.relaunch_backoff);
        *self
            .relaunch_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = relaunch_after;

        match launched {
            Ok(fresh) => {
                counter!("docpress_engine_recycle_total").increment(1);
                info!(
                    target = "application::render::engine",
                    old_instance = old.id,
                    new_instance = fresh.id,
                    renders_served = old.renders_served(),
                    "recycling render engine"
                );
                *current = Some(Arc::clone(&fresh));
                self.retire(old);
                fresh
            }
            Err(err) => {
                warn!(
                    target = "application::render::engine",
                    instance_id = old.id,
                    error = %err,
                    retry_in_ms = self.settings.relaunch_backoff.as_millis() as u64,
                    "replacement engine failed to start, keeping current instance"
                );
                old
            }
        }
    }

    async fn launch(&self) -> Result<Arc<EngineInstance>, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let started = Instant::now();
        info!(
            target = "application::render::engine",
            instance_id = id,
            "launching render engine"
        );

        let launched = timeout(self.settings.startup_timeout, async {
            let process = self.launcher.launch().await?;
            let instance = Arc::new(EngineInstance::new(id, process));
            instance.process.ping().await?;
            Ok::<_, EngineError>(instance)
        })
        .await;

        let instance = match launched {
            Ok(Ok(instance)) => instance,
            Ok(Err(err)) => {
                return Err(match err {
                    EngineError::Unavailable(_) => err,
                    other => EngineError::Unavailable(other.to_string()),
                });
            }
            Err(_) => {
                return Err(EngineError::Unavailable(format!(
                    "engine did not become responsive within {:?}",
                    self.settings.startup_timeout
                )));
            }
        };

        instance.set_state(LifecycleState::Ready);
        self.watch_disconnect(&instance);
        counter!("docpress_engine_launch_total").increment(1);
        info!(
            target = "application::render::engine",
            instance_id = id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "render engine ready"
        );
        Ok(instance)
    }

    /// Invalidate the instance as soon as its process disconnects unexpectedly.
    fn watch_disconnect(&self, instance: &Arc<EngineInstance>) {
        let slot = Arc::clone(&self.current);
        let weak = Arc::downgrade(instance);
        let mut disconnected = instance.process.disconnected();

        tokio::spawn(async move {
            if disconnected.wait_for(|down| *down).await.is_err() {
                return;
            }
            let Some(instance) = weak.upgrade() else {
                return;
            };
            if instance.state() == LifecycleState::Closed {
                return;
            }

            instance.crashed.store(true, Ordering::Release);
            instance.set_state(LifecycleState::Closed);

            let mut current = slot.lock().await;
            if current
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, &instance))
            {
                *current = None;
            }
            drop(current);

            counter!("docpress_engine_crash_total").increment(1);
            warn!(
                target = "application::render::engine",
                instance_id = instance.id,
                open_contexts = instance.open_contexts(),
                "render engine disconnected unexpectedly"
            );
        });
    }

    fn retire(&self, old: Arc<EngineInstance>) {
        old.set_state(LifecycleState::Draining);
        let mut open = old.open_contexts.subscribe();

        tokio::spawn(async move {
            let _ = open.wait_for(|count| *count == 0).await;
            if old.state() == LifecycleState::Draining {
                old.shutdown().await;
                info!(
                    target = "application::render::engine",
                    instance_id = old.id,
                    renders_served = old.renders_served(),
                    "drained render engine closed"
                );
            }
        });
    }
}

/// A borrowed rendering context. Close it with [`RenderingContext::close`];
/// dropping it closes it in the background.
pub struct RenderingContext {
    instance: Arc<EngineInstance>,
    inner: Option<Box<dyn EngineContext>>,
}

impl RenderingContext {
    pub fn instance_id(&self) -> u64 {
        self.instance.id
    }

    pub async fn set_content(&mut self, html: &str, wait: WaitCondition) -> Result<(), EngineError> {
        let inner = self.inner_mut()?;
        let result = inner.set_content(html, wait).await;
        result.map_err(|err| self.instance.classify(err))
    }

    pub async fn export_document(&mut self, layout: &Value) -> Result<Vec<u8>, EngineError> {
        let inner = self.inner_mut()?;
        let result = inner.export_document(layout).await;
        result.map_err(|err| self.instance.classify(err))
    }

    pub async fn close(mut self) {
        if let Some(inner) = self.inner.take() {
            close_quietly(self.instance.id, inner).await;
            self.instance.context_closed();
        }
    }

    fn inner_mut(&mut self) -> Result<&mut Box<dyn EngineContext>, EngineError> {
        self.inner
            .as_mut()
            .ok_or_else(|| EngineError::Operation("rendering context already closed".to_string()))
    }
}

impl Drop for RenderingContext {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let instance = Arc::clone(&self.instance);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    close_quietly(instance.id, inner).await;
                    instance.context_closed();
                });
            }
            Err(_) => instance.context_closed(),
        }
    }
}

async fn close_quietly(instance_id: u64, mut inner: Box<dyn EngineContext>) {
    if let Err(err) = inner.close().await {
        debug!(
            target = "application::render::engine",
            instance_id,
            error = %err,
            "ignoring failure while closing rendering context"
        );
    }
}
