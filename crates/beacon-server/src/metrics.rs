//! Metrics registration and export.
//!
//! Counters and gauges are recorded through the `metrics` facade by the
//! transport layer and the diagnostics task; this module describes them and
//! installs the Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const MESSAGES_TOTAL: &str = "beacon_messages_total";
    pub const REALMS_ACTIVE: &str = "beacon_realms_active";
    pub const CHANNELS_ACTIVE: &str = "beacon_channels_active";
}

/// Describe the metrics this node records.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of accepted connections since start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Total number of signalling messages processed"
    );
    metrics::describe_gauge!(names::REALMS_ACTIVE, "Current number of realms");
    metrics::describe_gauge!(
        names::CHANNELS_ACTIVE,
        "Current number of channels across all realms"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {addr}");
    Ok(())
}
