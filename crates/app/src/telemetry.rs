use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock, PoisonError},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::time::UtcTime, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use storefront_util::AppConfig;

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

const COUNTERS: &[(&str, &str)] = &[
    ("webhook_ingress_total", "Carrier webhook requests received, by HTTP method"),
    (
        "webhook_invalid_signature_total",
        "Carrier webhook deliveries whose signature did not verify, by reason",
    ),
    ("orders_reconciled_total", "Parcel updates applied to orders, by outcome"),
    (
        "order_status_regressions_total",
        "Delivery status overwrites that moved an order backwards",
    ),
    ("push_dispatch_total", "Web push attempts, by outcome"),
    ("db_ttl_deleted_total", "Rows removed by retention sweeps, by table"),
    ("db_busy_total", "SQLite busy conditions hit by maintenance, by operation"),
];

const HISTOGRAMS: &[(&str, &str)] = &[
    (
        "webhook_ack_latency_seconds",
        "Time to acknowledge a carrier webhook request, by HTTP method",
    ),
    ("db_checkpoint_seconds", "Duration of WAL checkpoints"),
];

static METRICS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static START_TIME: OnceLock<Instant> = OnceLock::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

fn git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber. JSON lines in production, pretty output otherwise.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());
    let fmt_layer = if config.environment.is_production() {
        base.json().boxed()
    } else {
        base.pretty().boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()?;

    tracing::info!(
        stage = "telemetry",
        env = config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder on first use and hands out clones afterwards.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut slot = METRICS_HANDLE
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    for (name, help) in COUNTERS {
        describe_counter!(*name, *help);
    }
    for (name, help) in HISTOGRAMS {
        describe_histogram!(*name, *help);
    }
    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the process started");
    START_TIME.get_or_init(Instant::now);

    *slot = Some(handle.clone());
    Ok(handle)
}

/// Recorder output followed by the build and uptime gauges, which are computed at scrape time.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    let _ = writeln!(body, "# TYPE app_build_info gauge");
    let _ = writeln!(
        body,
        "app_build_info{{version=\"{BUILD_VERSION}\",git=\"{}\"}} 1",
        git_sha()
    );
    let _ = writeln!(body, "# TYPE app_uptime_seconds gauge");
    let _ = writeln!(body, "app_uptime_seconds {uptime}");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;

    #[test]
    fn repeated_init_reuses_the_recorder() {
        let first = init_metrics().expect("first init");
        let second = init_metrics().expect("second init");

        counter!("push_dispatch_total", "outcome" => "delivered").increment(1);

        let rendered = render_metrics(&second);
        assert!(rendered.contains("push_dispatch_total"));
        assert!(rendered.contains("app_build_info{version=\""));
        assert!(rendered.ends_with('\n'));
        assert!(!first.render().is_empty());
    }
}
