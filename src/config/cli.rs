use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the docpress binary.
#[derive(Debug, Parser)]
#[command(
    name = "docpress",
    version,
    about = "Template-to-PDF rendering service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "DOCPRESS_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service (and, unless disabled, an embedded worker).
    Serve(Box<ServeArgs>),
    /// Run a standalone worker against the shared Postgres queue.
    Worker(WorkerArgs),
    /// Purge finished tasks past their retention window, then exit.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Override the Chrome/Chromium executable.
    #[arg(long = "engine-executable", value_name = "PATH")]
    pub engine_executable: Option<PathBuf>,

    /// Override how many renders one browser instance serves before it is replaced.
    #[arg(long = "engine-recycle-threshold", value_name = "COUNT")]
    pub engine_recycle_threshold: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the queue backend (postgres|memory).
    #[arg(long = "queue-backend", value_name = "BACKEND")]
    pub queue_backend: Option<String>,

    /// Override the number of tasks the embedded worker processes at once.
    #[arg(long = "worker-concurrency", value_name = "COUNT")]
    pub worker_concurrency: Option<u32>,

    /// Toggle the in-process worker.
    #[arg(
        long = "worker-embedded",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub worker_embedded: Option<bool>,

    /// Override the synchronous render concurrency limit.
    #[arg(long = "sync-concurrency", value_name = "COUNT")]
    pub sync_concurrency: Option<u32>,

    /// Override the templates directory.
    #[arg(long = "templates-directory", value_name = "PATH")]
    pub templates_directory: Option<PathBuf>,

    /// Override the output directory.
    #[arg(long = "output-directory", value_name = "PATH")]
    pub output_directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Override the number of tasks processed at once.
    #[arg(long = "worker-concurrency", value_name = "COUNT")]
    pub worker_concurrency: Option<u32>,

    /// Override the output directory.
    #[arg(long = "output-directory", value_name = "PATH")]
    pub output_directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the output directory.
    #[arg(long = "output-directory", value_name = "PATH")]
    pub output_directory: Option<PathBuf>,
}
