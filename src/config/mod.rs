//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    application::{
        jobs::{DEFAULT_RETENTION_SCHEDULE, QueuePolicy, WorkerSettings},
        render::{DEFAULT_RECYCLE_THRESHOLD, DEFAULT_SYNC_CONCURRENCY, EnginePoolSettings},
    },
    infra::chrome::ChromeSettings,
};

mod cli;

pub use cli::{
    CleanupArgs, CliArgs, Command, DatabaseOverride, EngineOverrides, LoggingOverrides, ServeArgs,
    ServeOverrides, WorkerArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "docpress";
const ENV_PREFIX: &str = "DOCPRESS";
const ENGINE_EXECUTABLE_ENV: &str = "CHROMIUM_PATH";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_BODY_LIMIT_BYTES: u64 = 30 * 1024 * 1024;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_STALLED_CHECK_SECS: u64 = 30;
const DEFAULT_COMPLETED_RETENTION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_FAILED_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_WORKER_CONCURRENCY: u64 = 5;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_ENGINE_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_VIEWPORT_WIDTH: u32 = 1200;
const DEFAULT_VIEWPORT_HEIGHT: u32 = 1697;
const DEFAULT_TEMPLATES_DIR: &str = "views";
const DEFAULT_OUTPUT_DIR: &str = "output";
const MAX_ATTEMPTS_CEILING: u64 = 25;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub queue: QueueSettings,
    pub worker: WorkerConfig,
    pub engine: EngineSettings,
    pub sync: SyncSettings,
    pub templates: TemplateSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub body_limit_bytes: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Postgres,
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown queue backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    pub database_url: Option<String>,
    pub max_connections: NonZeroU32,
    pub default_max_attempts: NonZeroU32,
    pub default_priority: i32,
    pub backoff_base: Duration,
    pub visibility_timeout: Duration,
    pub stalled_check_interval: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
    pub retention_schedule: String,
}

impl QueueSettings {
    pub fn policy(&self) -> QueuePolicy {
        QueuePolicy {
            default_max_attempts: self.default_max_attempts.get() as i32,
            default_priority: self.default_priority,
            backoff_base: self.backoff_base,
            visibility_timeout: self.visibility_timeout,
            completed_retention: self.completed_retention,
            failed_retention: self.failed_retention,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: NonZeroU32,
    pub poll_interval: Duration,
    /// Run a worker inside the `serve` process.
    pub embedded: bool,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub executable: Option<PathBuf>,
    pub recycle_threshold: NonZeroU64,
    pub startup_timeout: Duration,
    pub render_timeout: Duration,
    pub sandbox: bool,
    pub viewport: (u32, u32),
}

impl EngineSettings {
    pub fn pool_settings(&self) -> EnginePoolSettings {
        EnginePoolSettings {
            recycle_threshold: self.recycle_threshold.get(),
            startup_timeout: self.startup_timeout,
            ..EnginePoolSettings::default()
        }
    }

    pub fn chrome_settings(&self) -> ChromeSettings {
        ChromeSettings {
            executable: self.executable.clone(),
            sandbox: self.sandbox,
            viewport: self.viewport,
            settle_timeout: self.render_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub concurrency: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct TemplateSettings {
    pub directory: PathBuf,
    /// Exposed to templates as `SITE_URL`.
    pub site_url: String,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub directory: PathBuf,
    pub delete_after_download: bool,
}

impl Settings {
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            concurrency: self.worker.concurrency.get() as usize,
            poll_interval: self.worker.poll_interval,
            stalled_check_interval: self.queue.stalled_check_interval,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    if raw.engine.executable.is_none() {
        raw.engine.executable = std::env::var_os(ENGINE_EXECUTABLE_ENV).map(PathBuf::from);
    }

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Worker(args)) => raw.apply_worker_overrides(args),
        Some(Command::Cleanup(args)) => raw.apply_cleanup_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    queue: RawQueueSettings,
    worker: RawWorkerSettings,
    engine: RawEngineSettings,
    sync: RawSyncSettings,
    templates: RawTemplateSettings,
    output: RawOutputSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_logging_overrides(&overrides.logging);
        self.apply_database_override(&overrides.database);
        self.apply_engine_overrides(&overrides.engine);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(backend) = overrides.queue_backend.as_ref() {
            self.queue.backend = Some(backend.clone());
        }
        if let Some(concurrency) = overrides.worker_concurrency {
            self.worker.concurrency = Some(u64::from(concurrency));
        }
        if let Some(embedded) = overrides.worker_embedded {
            self.worker.embedded = Some(embedded);
        }
        if let Some(concurrency) = overrides.sync_concurrency {
            self.sync.concurrency = Some(u64::from(concurrency));
        }
        if let Some(dir) = overrides.templates_directory.as_ref() {
            self.templates.directory = Some(dir.clone());
        }
        if let Some(dir) = overrides.output_directory.as_ref() {
            self.output.directory = Some(dir.clone());
        }
    }

    fn apply_worker_overrides(&mut self, args: &WorkerArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_database_override(&args.database);
        self.apply_engine_overrides(&args.engine);
        // Standalone workers always share the Postgres queue.
        self.queue.backend = Some("postgres".to_string());

        if let Some(concurrency) = args.worker_concurrency {
            self.worker.concurrency = Some(u64::from(concurrency));
        }
        if let Some(dir) = args.output_directory.as_ref() {
            self.output.directory = Some(dir.clone());
        }
    }

    fn apply_cleanup_overrides(&mut self, args: &CleanupArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_database_override(&args.database);
        self.queue.backend = Some("postgres".to_string());

        if let Some(dir) = args.output_directory.as_ref() {
            self.output.directory = Some(dir.clone());
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.queue.database_url = Some(url.clone());
        }
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(path) = overrides.engine_executable.as_ref() {
            self.engine.executable = Some(path.clone());
        }
        if let Some(threshold) = overrides.engine_recycle_threshold {
            self.engine.recycle_threshold = Some(threshold);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            queue,
            worker,
            engine,
            sync,
            templates,
            output,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let queue = build_queue_settings(queue)?;
        let worker = build_worker_settings(worker)?;
        let engine = build_engine_settings(engine)?;
        let sync = build_sync_settings(sync)?;
        let templates = build_template_settings(templates, &server)?;
        let output = build_output_settings(output)?;

        Ok(Self {
            server,
            logging,
            queue,
            worker,
            engine,
            sync,
            templates,
            output,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let body_limit = server.body_limit_bytes.unwrap_or(DEFAULT_BODY_LIMIT_BYTES);
    let body_limit_bytes = NonZeroU64::new(body_limit)
        .ok_or_else(|| LoadError::invalid("server.body_limit_bytes", "must be greater than zero"))?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        body_limit_bytes,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let database_url = queue.database_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let backend = match queue.backend.as_deref() {
        Some(value) => QueueBackend::from_str(value)
            .map_err(|reason| LoadError::invalid("queue.backend", reason))?,
        None if database_url.is_some() => QueueBackend::Postgres,
        None => QueueBackend::Memory,
    };
    if backend == QueueBackend::Postgres && database_url.is_none() {
        return Err(LoadError::invalid(
            "queue.database_url",
            "required when the postgres backend is selected",
        ));
    }

    let max_connections = non_zero_u32(
        queue
            .max_connections
            .unwrap_or(u64::from(DEFAULT_DB_MAX_CONNECTIONS)),
        "queue.max_connections",
    )?;

    let max_attempts = queue.default_max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
    if max_attempts > MAX_ATTEMPTS_CEILING {
        return Err(LoadError::invalid(
            "queue.default_max_attempts",
            format!("must not exceed {MAX_ATTEMPTS_CEILING}"),
        ));
    }
    let default_max_attempts = non_zero_u32(max_attempts, "queue.default_max_attempts")?;

    let backoff_base = positive_duration(
        Duration::from_millis(queue.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS)),
        "queue.backoff_base_ms",
    )?;
    let visibility_timeout = positive_duration(
        Duration::from_secs(
            queue
                .visibility_timeout_seconds
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS),
        ),
        "queue.visibility_timeout_seconds",
    )?;
    let stalled_check_interval = positive_duration(
        Duration::from_secs(
            queue
                .stalled_check_interval_seconds
                .unwrap_or(DEFAULT_STALLED_CHECK_SECS),
        ),
        "queue.stalled_check_interval_seconds",
    )?;

    let retention_schedule = queue
        .retention_schedule
        .unwrap_or_else(|| DEFAULT_RETENTION_SCHEDULE.to_string());
    crate::application::jobs::retention_schedule(&retention_schedule)
        .map_err(|reason| LoadError::invalid("queue.retention_schedule", reason))?;

    Ok(QueueSettings {
        backend,
        database_url,
        max_connections,
        default_max_attempts,
        default_priority: queue.default_priority.unwrap_or(0),
        backoff_base,
        visibility_timeout,
        stalled_check_interval,
        completed_retention: Duration::from_secs(
            queue
                .completed_retention_seconds
                .unwrap_or(DEFAULT_COMPLETED_RETENTION_SECS),
        ),
        failed_retention: Duration::from_secs(
            queue
                .failed_retention_seconds
                .unwrap_or(DEFAULT_FAILED_RETENTION_SECS),
        ),
        retention_schedule,
    })
}

fn build_worker_settings(worker: RawWorkerSettings) -> Result<WorkerConfig, LoadError> {
    let concurrency = non_zero_u32(
        worker.concurrency.unwrap_or(DEFAULT_WORKER_CONCURRENCY),
        "worker.concurrency",
    )?;
    let poll_interval = positive_duration(
        Duration::from_millis(worker.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS)),
        "worker.poll_interval_ms",
    )?;

    Ok(WorkerConfig {
        concurrency,
        poll_interval,
        embedded: worker.embedded.unwrap_or(true),
    })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let executable = engine
        .executable
        .filter(|path| !path.as_os_str().is_empty());

    let recycle_threshold = NonZeroU64::new(
        engine
            .recycle_threshold
            .unwrap_or(DEFAULT_RECYCLE_THRESHOLD),
    )
    .ok_or_else(|| LoadError::invalid("engine.recycle_threshold", "must be greater than zero"))?;

    let startup_timeout = positive_duration(
        Duration::from_secs(
            engine
                .startup_timeout_seconds
                .unwrap_or(DEFAULT_ENGINE_STARTUP_TIMEOUT_SECS),
        ),
        "engine.startup_timeout_seconds",
    )?;
    let render_timeout = positive_duration(
        Duration::from_secs(
            engine
                .render_timeout_seconds
                .unwrap_or(DEFAULT_RENDER_TIMEOUT_SECS),
        ),
        "engine.render_timeout_seconds",
    )?;

    let width = engine.viewport_width.unwrap_or(DEFAULT_VIEWPORT_WIDTH);
    let height = engine.viewport_height.unwrap_or(DEFAULT_VIEWPORT_HEIGHT);
    if width == 0 || height == 0 {
        return Err(LoadError::invalid(
            "engine.viewport",
            "width and height must be greater than zero",
        ));
    }

    Ok(EngineSettings {
        executable,
        recycle_threshold,
        startup_timeout,
        render_timeout,
        sandbox: engine.sandbox.unwrap_or(false),
        viewport: (width, height),
    })
}

fn build_sync_settings(sync: RawSyncSettings) -> Result<SyncSettings, LoadError> {
    let concurrency = non_zero_u32(
        sync.concurrency
            .unwrap_or(DEFAULT_SYNC_CONCURRENCY as u64),
        "sync.concurrency",
    )?;
    Ok(SyncSettings { concurrency })
}

fn build_template_settings(
    templates: RawTemplateSettings,
    server: &ServerSettings,
) -> Result<TemplateSettings, LoadError> {
    let directory = templates
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATES_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "templates.directory",
            "directory path must not be empty",
        ));
    }

    let site_url = templates
        .site_url
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| format!("http://localhost:{}", server.addr.port()));

    Ok(TemplateSettings {
        directory,
        site_url,
    })
}

fn build_output_settings(output: RawOutputSettings) -> Result<OutputSettings, LoadError> {
    let directory = output
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "output.directory",
            "directory path must not be empty",
        ));
    }

    Ok(OutputSettings {
        directory,
        delete_after_download: output.delete_after_download.unwrap_or(false),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    body_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    backend: Option<String>,
    database_url: Option<String>,
    max_connections: Option<u64>,
    default_max_attempts: Option<u64>,
    default_priority: Option<i32>,
    backoff_base_ms: Option<u64>,
    visibility_timeout_seconds: Option<u64>,
    stalled_check_interval_seconds: Option<u64>,
    completed_retention_seconds: Option<u64>,
    failed_retention_seconds: Option<u64>,
    retention_schedule: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    concurrency: Option<u64>,
    poll_interval_ms: Option<u64>,
    embedded: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    executable: Option<PathBuf>,
    recycle_threshold: Option<u64>,
    startup_timeout_seconds: Option<u64>,
    render_timeout_seconds: Option<u64>,
    sandbox: Option<bool>,
    viewport_width: Option<u32>,
    viewport_height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSyncSettings {
    concurrency: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTemplateSettings {
    directory: Option<PathBuf>,
    site_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOutputSettings {
    directory: Option<PathBuf>,
    delete_after_download: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_duration(value: Duration, key: &'static str) -> Result<Duration, LoadError> {
    if value.is_zero() {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
