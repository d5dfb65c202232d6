//! Headless Chrome adapter for the render engine pool.
//!
//! `headless_chrome` is blocking, so every call into it runs on the blocking
//! thread pool.

use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use headless_chrome::{
    Browser, LaunchOptions, Tab,
    protocol::cdp::{Page, types::Event},
    types::PrintToPdfOptions,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::{sync::watch, time::sleep};
use tracing::{debug, warn};

use crate::application::render::{
    EngineContext, EngineError, EngineLauncher, EngineProcess, WaitCondition,
};

const CHROME_ARGS: &[&str] = &[
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--font-render-hinting=none",
];

/// Only passed when the sandbox is switched off.
const NO_SANDBOX_ARGS: &[&str] = &["--no-sandbox", "--disable-setuid-sandbox"];

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// No new resource entries for this long counts as network idle.
const NETWORK_QUIET_WINDOW: Duration = Duration::from_millis(500);

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

const READINESS_SCRIPT: &str = "JSON.stringify({readyState: document.readyState, \
     resources: performance.getEntriesByType('resource').length})";

/// headless_chrome kills a browser that sees no events for this long.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

const DEFAULT_FOOTER: &str = r#"<div style="width: 100%; text-align: center; margin: 10px auto 0; color: #333; font-size: 10px;"><span>Page <span class="pageNumber"></span> / <span class="totalPages"></span></span></div>"#;

const CSS_PX_PER_INCH: f64 = 96.0;

#[derive(Debug, Clone)]
pub struct ChromeSettings {
    /// Browser binary; auto-detected when `None`.
    pub executable: Option<PathBuf>,
    pub sandbox: bool,
    pub viewport: (u32, u32),
    /// Upper bound on waiting for a page to finish loading.
    pub settle_timeout: Duration,
}

impl Default for ChromeSettings {
    fn default() -> Self {
        Self {
            executable: None,
            sandbox: false,
            viewport: (1200, 1697),
            settle_timeout: Duration::from_secs(30),
        }
    }
}

fn launch_args(sandbox: bool) -> Vec<OsString> {
    let extra = if sandbox { &[][..] } else { NO_SANDBOX_ARGS };
    CHROME_ARGS
        .iter()
        .chain(extra)
        .map(OsString::from)
        .collect()
}

pub struct ChromeLauncher {
    settings: ChromeSettings,
}

impl ChromeLauncher {
    pub fn new(settings: ChromeSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EngineLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn EngineProcess>, EngineError> {
        let settings = self.settings.clone();
        let browser = blocking(move || {
            let args = launch_args(settings.sandbox);
            let options = LaunchOptions::default_builder()
                .headless(true)
                .sandbox(settings.sandbox)
                .path(settings.executable.clone())
                .window_size(Some(settings.viewport))
                .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
                .args(args.iter().map(OsString::as_os_str).collect::<Vec<&OsStr>>())
                .build()
                .map_err(|err| EngineError::Unavailable(err.to_string()))?;

            Browser::new(options).map_err(|err| EngineError::Unavailable(err.to_string()))
        })
        .await?;

        Ok(Arc::new(ChromeProcess::start(browser, self.settings.settle_timeout)))
    }
}

struct ChromeProcess {
    browser: StdMutex<Option<Browser>>,
    settle_timeout: Duration,
    disconnected: watch::Sender<bool>,
    terminated: Arc<AtomicBool>,
}

impl ChromeProcess {
    fn start(browser: Browser, settle_timeout: Duration) -> Self {
        let (disconnected, _) = watch::channel(false);
        let terminated = Arc::new(AtomicBool::new(false));

        spawn_heartbeat(browser.clone(), disconnected.clone(), Arc::clone(&terminated));

        Self {
            browser: StdMutex::new(Some(browser)),
            settle_timeout,
            disconnected,
            terminated,
        }
    }

    fn browser(&self) -> Result<Browser, EngineError> {
        self.browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| EngineError::Crashed("browser already terminated".to_string()))
    }
}

/// Ping the browser every second; flip `disconnected` on the first failure.
fn spawn_heartbeat(
    browser: Browser,
    disconnected: watch::Sender<bool>,
    terminated: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            sleep(HEARTBEAT_INTERVAL).await;
            if terminated.load(Ordering::Acquire) {
                return;
            }

            let pinged = browser.clone();
            let alive = tokio::task::spawn_blocking(move || pinged.get_version().is_ok())
                .await
                .unwrap_or(false);

            if !alive && !terminated.load(Ordering::Acquire) {
                warn!(target = "infra::chrome", "browser stopped answering heartbeats");
                disconnected.send_replace(true);
                return;
            }
        }
    });
}

#[async_trait]
impl EngineProcess for ChromeProcess {
    async fn ping(&self) -> Result<(), EngineError> {
        let browser = self.browser()?;
        blocking(move || {
            browser
                .get_version()
                .map(|_| ())
                .map_err(|err| EngineError::Unavailable(err.to_string()))
        })
        .await
    }

    async fn new_context(&self) -> Result<Box<dyn EngineContext>, EngineError> {
        let browser = self.browser()?;
        let tab = blocking(move || browser.new_tab().map_err(chrome_error)).await?;
        Ok(Box::new(ChromeContext {
            tab,
            settle_timeout: self.settle_timeout,
        }))
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }

    async fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(browser) = browser {
            // Dropping the last handle kills the child process.
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
            debug!(target = "infra::chrome", "browser terminated");
        }
    }
}

struct ChromeContext {
    tab: Arc<Tab>,
    settle_timeout: Duration,
}

#[async_trait]
impl EngineContext for ChromeContext {
    async fn set_content(&mut self, html: &str, wait: WaitCondition) -> Result<(), EngineError> {
        let tab = Arc::clone(&self.tab);
        let html = html.to_string();
        let limit = self.settle_timeout;
        blocking(move || load_document(&tab, html, wait, limit)).await
    }

    async fn export_document(&mut self, layout: &Value) -> Result<Vec<u8>, EngineError> {
        let options = pdf_options(layout);
        let tab = Arc::clone(&self.tab);
        blocking(move || tab.print_to_pdf(Some(options)).map_err(chrome_error)).await
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        let tab = Arc::clone(&self.tab);
        blocking(move || tab.close(false).map(|_| ()).map_err(chrome_error)).await
    }
}

/// Write `html` into a blank page's main frame. Unlike a `data:` URL this
/// has no size ceiling.
fn load_document(
    tab: &Tab,
    html: String,
    wait: WaitCondition,
    limit: Duration,
) -> Result<(), EngineError> {
    tab.navigate_to("about:blank")
        .and_then(|tab| tab.wait_until_navigated())
        .map_err(chrome_error)?;
    tab.call_method(Page::SetLifecycleEventsEnabled { enabled: true })
        .map_err(chrome_error)?;
    let frame_id = tab
        .call_method(Page::GetFrameTree(None))
        .map_err(chrome_error)?
        .frame_tree
        .frame
        .id;

    let lifecycle = Arc::new(StdMutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&lifecycle);
    let main_frame = frame_id.clone();
    let listener = tab
        .add_event_listener(Arc::new(move |event: &Event| {
            if let Event::PageLifecycleEvent(event) = event {
                if event.params.frame_id == main_frame {
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(event.params.name.clone());
                }
            }
        }))
        .map_err(chrome_error)?;

    let loaded = tab
        .call_method(Page::SetDocumentContent { frame_id, html })
        .map_err(chrome_error)
        .and_then(|_| wait_until_settled(tab, wait, limit, &lifecycle));

    if let Err(err) = tab.remove_event_listener(&listener) {
        debug!(target = "infra::chrome", error = %err, "failed to detach lifecycle listener");
    }
    loaded
}

fn wait_until_settled(
    tab: &Tab,
    wait: WaitCondition,
    limit: Duration,
    lifecycle: &StdMutex<Vec<String>>,
) -> Result<(), EngineError> {
    let deadline = Instant::now() + limit;
    let mut settle = PageSettle::new(wait, NETWORK_QUIET_WINDOW);

    loop {
        let sample = sample_readiness(tab)?;
        let now = Instant::now();
        let seen = lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if settle.observe(&sample, &seen, now) {
            return Ok(());
        }
        if now >= deadline {
            return Err(EngineError::Operation(format!(
                "page did not settle within {limit:?}"
            )));
        }
        std::thread::sleep(SETTLE_POLL_INTERVAL);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessSample {
    ready_state: String,
    resources: usize,
}

fn sample_readiness(tab: &Tab) -> Result<ReadinessSample, EngineError> {
    let value = tab
        .evaluate(READINESS_SCRIPT, false)
        .map_err(chrome_error)?
        .value;
    let raw = value
        .as_ref()
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Operation("page readiness check returned nothing".to_string()))?;
    serde_json::from_str(raw)
        .map_err(|err| EngineError::Operation(format!("unreadable page readiness: {err}")))
}

/// Decides from periodic readiness samples when a page is done loading.
///
/// `Load` settles once the document is complete. `NetworkIdle` additionally
/// needs Chrome's `networkIdle` lifecycle event for the new document, or no
/// new resource entries for a full quiet window.
struct PageSettle {
    wait: WaitCondition,
    quiet: Duration,
    resources: usize,
    stable_since: Option<Instant>,
}

impl PageSettle {
    fn new(wait: WaitCondition, quiet: Duration) -> Self {
        Self {
            wait,
            quiet,
            resources: 0,
            stable_since: None,
        }
    }

    fn observe(&mut self, sample: &ReadinessSample, lifecycle: &[String], now: Instant) -> bool {
        if sample.ready_state != "complete" {
            self.stable_since = None;
            return false;
        }
        if self.wait == WaitCondition::Load || reached_network_idle(lifecycle) {
            return true;
        }

        if self.stable_since.is_none() || sample.resources != self.resources {
            self.resources = sample.resources;
            self.stable_since = Some(now);
        }
        self.stable_since
            .is_some_and(|since| now.duration_since(since) >= self.quiet)
    }
}

/// `networkIdle` only counts after the replaced document began its own
/// lifecycle; earlier ones belong to `about:blank`.
fn reached_network_idle(lifecycle: &[String]) -> bool {
    lifecycle
        .iter()
        .skip_while(|name| !matches!(name.as_str(), "init" | "DOMContentLoaded"))
        .any(|name| name == "networkIdle")
}

async fn blocking<T, F>(job: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| EngineError::Operation(format!("engine call aborted: {err}")))?
}

fn chrome_error(err: impl std::fmt::Display) -> EngineError {
    let message = err.to_string();
    if message.contains("connection is closed") || message.contains("No such process") {
        EngineError::Crashed(message)
    } else {
        EngineError::Operation(message)
    }
}

/// Map caller layout options (paper format, margins, header/footer markup)
/// onto Chrome's print parameters, starting from the service defaults.
pub fn pdf_options(layout: &Value) -> PrintToPdfOptions {
    let get = |key: &str| layout.get(key);
    let flag = |key: &str, default: bool| get(key).and_then(Value::as_bool).unwrap_or(default);
    let text = |key: &str| get(key).and_then(Value::as_str).map(str::to_string);

    let (mut width, mut height) = text("format")
        .as_deref()
        .and_then(paper_size)
        .unwrap_or(A4);
    if let Some(custom) = get("width").and_then(length_in_inches) {
        width = custom;
    }
    if let Some(custom) = get("height").and_then(length_in_inches) {
        height = custom;
    }

    let margin = |side: &str, default: f64| {
        get("margin")
            .and_then(|margin| margin.get(side))
            .and_then(length_in_inches)
            .unwrap_or(default)
    };

    PrintToPdfOptions {
        landscape: Some(flag("landscape", false)),
        display_header_footer: Some(flag("displayHeaderFooter", true)),
        print_background: Some(flag("printBackground", true)),
        scale: get("scale").and_then(Value::as_f64),
        paper_width: Some(width),
        paper_height: Some(height),
        margin_top: Some(margin("top", 0.0)),
        margin_bottom: Some(margin("bottom", 40.0 / CSS_PX_PER_INCH)),
        margin_left: Some(margin("left", 0.0)),
        margin_right: Some(margin("right", 0.0)),
        page_ranges: text("pageRanges"),
        header_template: Some(text("headerTemplate").unwrap_or_default()),
        footer_template: Some(text("footerTemplate").unwrap_or_else(|| DEFAULT_FOOTER.to_string())),
        prefer_css_page_size: get("preferCSSPageSize").and_then(Value::as_bool),
        ..Default::default()
    }
}

const A4: (f64, f64) = (8.27, 11.69);

fn paper_size(format: &str) -> Option<(f64, f64)> {
    match format.to_ascii_lowercase().as_str() {
        "a3" => Some((11.69, 16.54)),
        "a4" => Some(A4),
        "a5" => Some((5.83, 8.27)),
        "letter" => Some((8.5, 11.0)),
        "legal" => Some((8.5, 14.0)),
        "tabloid" => Some((11.0, 17.0)),
        _ => None,
    }
}

/// Bare numbers are CSS pixels; strings may carry `px`, `in`, `cm` or `mm`.
fn length_in_inches(value: &Value) -> Option<f64> {
    if let Some(px) = value.as_f64() {
        return Some(px / CSS_PX_PER_INCH);
    }

    let raw = value.as_str()?.trim().to_ascii_lowercase();
    let (number, divisor) = if let Some(number) = raw.strip_suffix("px") {
        (number, CSS_PX_PER_INCH)
    } else if let Some(number) = raw.strip_suffix("in") {
        (number, 1.0)
    } else if let Some(number) = raw.strip_suffix("cm") {
        (number, 2.54)
    } else if let Some(number) = raw.strip_suffix("mm") {
        (number, 25.4)
    } else {
        (raw.as_str(), CSS_PX_PER_INCH)
    };

    number
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
        .map(|value| value / divisor)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-6)
    }

    #[test]
    fn defaults_match_service_layout() {
        let options = pdf_options(&Value::Null);
        assert_eq!(options.paper_width, Some(8.27));
        assert_eq!(options.paper_height, Some(11.69));
        assert_eq!(options.print_background, Some(true));
        assert_eq!(options.display_header_footer, Some(true));
        assert_eq!(options.header_template.as_deref(), Some(""));
        assert!(
            options
                .footer_template
                .as_deref()
                .is_some_and(|footer| footer.contains("pageNumber"))
        );
        assert!(close(options.margin_bottom, 40.0 / 96.0));
        assert!(close(options.margin_top, 0.0));
    }

    #[test]
    fn caller_options_override_defaults() {
        let options = pdf_options(&json!({
            "format": "Letter",
            "landscape": true,
            "printBackground": false,
            "margin": {"top": "1in", "left": "25.4mm", "bottom": 96},
            "footerTemplate": "<span></span>"
        }));
        assert_eq!(options.paper_width, Some(8.5));
        assert_eq!(options.landscape, Some(true));
        assert_eq!(options.print_background, Some(false));
        assert!(close(options.margin_top, 1.0));
        assert!(close(options.margin_left, 1.0));
        assert!(close(options.margin_bottom, 1.0));
        assert_eq!(options.footer_template.as_deref(), Some("<span></span>"));
    }

    #[test]
    fn lengths_reject_garbage() {
        assert_eq!(length_in_inches(&json!("wide")), None);
        assert_eq!(length_in_inches(&json!("-3px")), None);
        assert!(close(length_in_inches(&json!("2.54cm")), 1.0));
    }

    fn sample(ready_state: &str, resources: usize) -> ReadinessSample {
        ReadinessSample {
            ready_state: ready_state.to_string(),
            resources,
        }
    }

    fn names(events: &[&str]) -> Vec<String> {
        events.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn sandbox_flags_follow_the_setting() {
        let sandboxed = launch_args(true);
        assert!(!sandboxed.iter().any(|arg| arg == "--no-sandbox"));
        assert!(!sandboxed.iter().any(|arg| arg == "--disable-setuid-sandbox"));
        assert!(sandboxed.iter().any(|arg| arg == "--disable-gpu"));

        let unsandboxed = launch_args(false);
        assert!(unsandboxed.iter().any(|arg| arg == "--no-sandbox"));
        assert!(unsandboxed.iter().any(|arg| arg == "--disable-setuid-sandbox"));
    }

    #[test]
    fn load_settles_once_the_document_is_complete() {
        let start = Instant::now();
        let mut settle = PageSettle::new(WaitCondition::Load, NETWORK_QUIET_WINDOW);
        assert!(!settle.observe(&sample("interactive", 0), &[], start));
        assert!(settle.observe(&sample("complete", 3), &[], start));
    }

    #[test]
    fn network_idle_waits_for_a_quiet_window() {
        let start = Instant::now();
        let quiet = Duration::from_millis(500);
        let mut settle = PageSettle::new(WaitCondition::NetworkIdle, quiet);

        assert!(!settle.observe(&sample("complete", 2), &[], start));
        let later = start + Duration::from_millis(400);
        assert!(!settle.observe(&sample("complete", 3), &[], later));
        // A new resource restarted the window.
        assert!(!settle.observe(&sample("complete", 3), &[], later + Duration::from_millis(300)));
        assert!(settle.observe(&sample("complete", 3), &[], later + quiet));
    }

    #[test]
    fn network_idle_lifecycle_event_settles_immediately() {
        let start = Instant::now();
        let mut settle = PageSettle::new(WaitCondition::NetworkIdle, NETWORK_QUIET_WINDOW);
        let events = names(&["init", "DOMContentLoaded", "load", "networkAlmostIdle", "networkIdle"]);
        assert!(!settle.observe(&sample("loading", 0), &events, start));
        assert!(settle.observe(&sample("complete", 1), &events, start));
    }

    #[test]
    fn stale_network_idle_is_ignored() {
        assert!(!reached_network_idle(&names(&["networkAlmostIdle", "networkIdle"])));
        assert!(!reached_network_idle(&names(&["networkIdle", "init", "load"])));
        assert!(reached_network_idle(&names(&["networkIdle", "init", "networkIdle"])));
    }

    #[test]
    fn closed_connections_are_crashes() {
        assert!(matches!(
            chrome_error("Unable to make method calls because underlying connection is closed"),
            EngineError::Crashed(_)
        ));
        assert!(matches!(chrome_error("timeout"), EngineError::Operation(_)));
    }
}
