//! Prometheus metrics exporter

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus recorder with its own HTTP listener.
///
/// Must be called from within the tokio runtime.
pub fn init_metrics(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()?;

    describe_metrics();
    info!("Prometheus metrics exposed on http://{}/metrics", listen);
    Ok(())
}

/// Describe metrics
pub fn describe_metrics() {
    describe_counter!(
        "sip_requests_total",
        "Total number of SIP requests dispatched, by method"
    );
    describe_counter!(
        "sip_registrations_total",
        "Total number of SIP registrations, by success"
    );
    describe_counter!(
        "sip_relay_exchanges_total",
        "Total number of relayed exchanges, by outcome"
    );
    describe_gauge!(
        "sip_registered_users",
        "Number of currently registered SIP users"
    );
}
