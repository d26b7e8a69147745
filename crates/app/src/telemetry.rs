use std::{
    sync::{Mutex, OnceLock},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

use mutuus_notify_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error("metrics install guard poisoned")]
    InstallGuard,
}

enum Kind {
    Counter,
    Histogram,
}

/// Metrics emitted outside this module.
const METRICS: &[(&str, Kind, &str)] = &[
    ("dispatch_outcomes_total", Kind::Counter, "Dispatched intents, labelled by outcome"),
    ("delivery_attempts_total", Kind::Counter, "Channel deliveries, labelled by channel and result"),
    ("dispatch_latency_seconds", Kind::Histogram, "Seconds spent evaluating and delivering one intent"),
    ("lease_purged_total", Kind::Counter, "Expired dedupe and rate-limit leases removed by maintenance"),
    ("event_log_trimmed_total", Kind::Counter, "Notification event log rows removed by maintenance"),
    ("tracking_events_total", Kind::Counter, "Delivery tracking events, labelled by kind"),
    ("tracking_invalid_signature_total", Kind::Counter, "Tracking webhooks rejected for a bad signature"),
    ("db_busy_total", Kind::Counter, "SQLite busy timeouts hit by maintenance, labelled by operation"),
];

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_INSTALL_GUARD: Mutex<()> = Mutex::new(());
static START_TIME: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Installs the global subscriber: pretty output in development and test, JSON in production.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.environment {
        Environment::Production => base.json().boxed(),
        Environment::Development | Environment::Test => base.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()?;

    tracing::info!(stage = "telemetry", env = %config.environment.as_str(), version = BUILD_VERSION, "tracing initialized");
    Ok(())
}

/// Installs the Prometheus recorder once per process and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let _guard = METRICS_INSTALL_GUARD
        .lock()
        .map_err(|_| TelemetryError::InstallGuard)?;
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    METRICS_HANDLE.set(handle.clone()).ok();

    for (name, kind, help) in METRICS {
        match kind {
            Kind::Counter => describe_counter!(*name, *help),
            Kind::Histogram => describe_histogram!(*name, *help),
        }
    }
    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the process started");
    gauge!("app_build_info", "version" => BUILD_VERSION).set(1.0);
    START_TIME.get_or_init(Instant::now);

    Ok(handle)
}

/// Renders the exposition body, refreshing the uptime gauge first.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    gauge!("app_uptime_seconds").set(uptime);
    handle.render()
}
