use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::render::{
    METRIC_CACHE_HITS, METRIC_CHUNK_MS, METRIC_FORMULAS, METRIC_RENDER_FAILURES,
    METRIC_ROUND_TRIPS,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr so stdout stays free for rendered output.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_FORMULAS,
            Unit::Count,
            "Total number of formulas submitted for rendering."
        );
        describe_counter!(
            METRIC_CACHE_HITS,
            Unit::Count,
            "Total number of formulas served from the persistent cache."
        );
        describe_counter!(
            METRIC_ROUND_TRIPS,
            Unit::Count,
            "Total number of chunk exchanges with the renderer process."
        );
        describe_counter!(
            METRIC_RENDER_FAILURES,
            Unit::Count,
            "Total number of formulas the renderer rejected or omitted."
        );
        describe_histogram!(
            METRIC_CHUNK_MS,
            Unit::Milliseconds,
            "Renderer round-trip latency per chunk in milliseconds."
        );
    });
}
