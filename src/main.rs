use std::{process, sync::Arc, time::Instant};

use apalis::prelude::{Monitor, WorkerBuilder, WorkerFactoryFn};
use apalis_cron::CronStream;
use docpress::{
    application::{
        error::AppError,
        jobs::{
            JobWorkerContext, RenderQueue, RenderWorker, process_retention_job,
            retention_schedule, run_retention,
        },
        render::{ConcurrencyLimiter, DocumentRenderer, EnginePool},
        repos::TaskStore,
    },
    config::{self, LoadError, QueueBackend},
    infra::{
        chrome::ChromeLauncher,
        db::PostgresTaskStore,
        error::InfraError,
        http::{self, AppState},
        memory::MemoryTaskStore,
        output::OutputStore,
        telemetry,
        templates::FsTemplateRenderer,
    },
};
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(i32::from(error.exit_code()));
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err: LoadError| AppError::from(InfraError::configuration(err.to_string())))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Worker(_) => run_worker(settings).await,
        config::Command::Cleanup(_) => run_cleanup(settings).await,
    }
}

/// Everything both render paths share.
struct Runtime {
    context: JobWorkerContext,
    engine: Arc<EnginePool>,
}

fn build_runtime(
    settings: &config::Settings,
    store: Arc<dyn TaskStore>,
) -> Result<Runtime, AppError> {
    let queue = RenderQueue::new(store, settings.queue.policy());

    let launcher = Arc::new(ChromeLauncher::new(settings.engine.chrome_settings()));
    let engine = Arc::new(EnginePool::new(launcher, settings.engine.pool_settings()));

    let templates = Arc::new(FsTemplateRenderer::new(
        settings.templates.directory.clone(),
        settings.templates.site_url.clone(),
    ));
    let renderer = Arc::new(DocumentRenderer::new(
        templates,
        Arc::clone(&engine),
        settings.engine.render_timeout,
    ));

    let output = OutputStore::new(settings.output.directory.clone()).map_err(InfraError::from)?;

    Ok(Runtime {
        context: JobWorkerContext {
            queue,
            renderer,
            output: Arc::new(output),
        },
        engine,
    })
}

/// Open the task store. With `tolerate_outage`, an unreachable Postgres
/// yields a lazily-connecting store so the synchronous path keeps serving.
async fn init_store(
    settings: &config::Settings,
    tolerate_outage: bool,
) -> Result<Arc<dyn TaskStore>, AppError> {
    match settings.queue.backend {
        QueueBackend::Memory => {
            info!(target = "docpress::bootstrap", "using in-memory render queue");
            Ok(Arc::new(MemoryTaskStore::new()))
        }
        QueueBackend::Postgres => {
            let url = settings.queue.database_url.as_deref().ok_or_else(|| {
                InfraError::configuration(
                    "queue.database_url is required for the postgres backend",
                )
            })?;
            let max_connections = settings.queue.max_connections.get();

            let connected = async {
                let pool = PostgresTaskStore::connect(url, max_connections).await?;
                PostgresTaskStore::run_migrations(&pool).await?;
                Ok::<_, sqlx::Error>(pool)
            }
            .await;

            match connected {
                Ok(pool) => {
                    info!(target = "docpress::bootstrap", "using postgres render queue");
                    Ok(Arc::new(PostgresTaskStore::new(pool)))
                }
                Err(err) if tolerate_outage => {
                    warn!(
                        target = "docpress::bootstrap",
                        error = %err,
                        "render queue backend unreachable; async endpoints report unavailable until it recovers"
                    );
                    let pool = PostgresTaskStore::connect_lazy(url, max_connections)
                        .map_err(InfraError::from)?;
                    Ok(Arc::new(PostgresTaskStore::new(pool)))
                }
                Err(err) => Err(InfraError::from(err).into()),
            }
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = init_store(&settings, true).await?;
    let runtime = build_runtime(&settings, store)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handle = settings.worker.embedded.then(|| {
        let worker = RenderWorker::new(
            worker_id("serve"),
            runtime.context.clone(),
            settings.worker_settings(),
        );
        tokio::spawn(worker.run(shutdown_rx.clone()))
    });
    let monitor_handle =
        spawn_retention_monitor(runtime.context.clone(), &settings.queue.retention_schedule)?;

    let state = AppState {
        queue: runtime.context.queue.clone(),
        renderer: Arc::clone(&runtime.context.renderer),
        limiter: ConcurrencyLimiter::new(settings.sync.concurrency.get() as usize),
        output: Arc::clone(&runtime.context.output),
        delete_after_download: settings.output.delete_after_download,
        started_at: Instant::now(),
    };
    let body_limit = usize::try_from(settings.server.body_limit_bytes.get()).unwrap_or(usize::MAX);
    let router = http::build_router(state, body_limit);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "docpress::bootstrap",
        addr = %settings.server.addr,
        embedded_worker = settings.worker.embedded,
        sync_concurrency = settings.sync.concurrency.get(),
        "docpress listening"
    );

    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| InfraError::server(err.to_string()));

    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        drain_worker(handle, &settings).await;
    }
    monitor_handle.abort();
    runtime.engine.shutdown().await;

    served.map_err(AppError::from)
}

async fn run_worker(settings: config::Settings) -> Result<(), AppError> {
    let store = init_store(&settings, false).await?;
    let runtime = build_runtime(&settings, store)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = RenderWorker::new(
        worker_id("worker"),
        runtime.context.clone(),
        settings.worker_settings(),
    );
    let handle = tokio::spawn(worker.run(shutdown_rx));
    let monitor_handle =
        spawn_retention_monitor(runtime.context.clone(), &settings.queue.retention_schedule)?;

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    drain_worker(handle, &settings).await;
    monitor_handle.abort();
    runtime.engine.shutdown().await;

    Ok(())
}

async fn run_cleanup(settings: config::Settings) -> Result<(), AppError> {
    let store = init_store(&settings, false).await?;
    let runtime = build_runtime(&settings, store)?;

    let report = run_retention(&runtime.context).await?;
    info!(
        target = "docpress::cleanup",
        completed = report.completed.len(),
        failed = report.failed.len(),
        "retention pass finished"
    );
    Ok(())
}

fn spawn_retention_monitor(
    context: JobWorkerContext,
    expression: &str,
) -> Result<JoinHandle<()>, AppError> {
    let schedule = retention_schedule(expression).map_err(InfraError::configuration)?;

    let retention_worker = WorkerBuilder::new("retention-worker")
        .data(context)
        .backend(CronStream::new(schedule))
        .build_fn(process_retention_job);

    let monitor = Monitor::new().register(retention_worker);

    Ok(tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "retention monitor stopped");
        }
    }))
}

async fn drain_worker(handle: JoinHandle<()>, settings: &config::Settings) {
    match timeout(settings.server.graceful_shutdown, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "render worker task failed"),
        Err(_) => warn!(
            target = "docpress::bootstrap",
            timeout_secs = settings.server.graceful_shutdown.as_secs(),
            "render worker did not drain in time; leased tasks will be reclaimed as stalled"
        ),
    }
}

fn worker_id(role: &str) -> String {
    format!("{role}-{}", process::id())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(target = "docpress::bootstrap", "shutdown signal received");
}
