//! Metrics collection and exposition.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize metrics exporter and server.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("Metrics server listening on http://{}", addr);
}

/// Helper to record a forwarded connection.
pub fn record_forward(upstream: &str, backend: &str) {
    let labels = [
        ("upstream", upstream.to_string()),
        ("backend", backend.to_string()),
    ];
    counter!("balancer_connections_total", &labels).increment(1);
}

/// Helper to record a rate-limited client.
pub fn record_rate_limited(client: &str) {
    counter!("balancer_rate_limited_total", "client" => client.to_string()).increment(1);
}

/// Helper to update backend health status for metrics.
pub fn record_backend_health(backend: &str, healthy: bool) {
    let val = if healthy { 1.0 } else { 0.0 };
    gauge!("balancer_backend_healthy", "backend" => backend.to_string()).set(val);
}
