use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "docpress_render_total",
            Unit::Count,
            "Documents rendered successfully, across both paths."
        );
        describe_counter!(
            "docpress_render_failed_total",
            Unit::Count,
            "Document renders that failed."
        );
        describe_histogram!(
            "docpress_render_ms",
            Unit::Milliseconds,
            "Template plus engine render latency in milliseconds."
        );
        describe_counter!(
            "docpress_engine_launch_total",
            Unit::Count,
            "Render engine processes launched."
        );
        describe_counter!(
            "docpress_engine_recycle_total",
            Unit::Count,
            "Render engine instances replaced after reaching the recycle threshold."
        );
        describe_counter!(
            "docpress_engine_crash_total",
            Unit::Count,
            "Render engine processes that disconnected unexpectedly."
        );
        describe_gauge!(
            "docpress_sync_in_flight",
            Unit::Count,
            "Synchronous renders currently running."
        );
        describe_gauge!(
            "docpress_sync_queued",
            Unit::Count,
            "Synchronous renders waiting for a slot."
        );
        describe_counter!(
            "docpress_tasks_enqueued_total",
            Unit::Count,
            "Render tasks added to the durable queue."
        );
        describe_counter!(
            "docpress_tasks_completed_total",
            Unit::Count,
            "Render tasks completed."
        );
        describe_counter!(
            "docpress_tasks_failed_total",
            Unit::Count,
            "Render tasks that failed permanently."
        );
        describe_counter!(
            "docpress_tasks_retried_total",
            Unit::Count,
            "Failed attempts scheduled for a backoff retry."
        );
        describe_counter!(
            "docpress_tasks_stalled_total",
            Unit::Count,
            "Leases that expired and were reclaimed."
        );
        describe_counter!(
            "docpress_tasks_purged_total",
            Unit::Count,
            "Finished tasks removed by retention."
        );
    });
}
