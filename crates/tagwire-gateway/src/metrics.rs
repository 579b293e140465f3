//! Metrics recording. Without an installed recorder these are no-ops.

#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
#[cfg(feature = "prometheus")]
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Record a WebSocket connection starting to serve.
pub fn record_ws_connect() {
    metrics::gauge!("tagwire_connections_active").increment(1.0);
    metrics::counter!("tagwire_connections_total").increment(1);
}

/// Record a served connection ending.
pub fn record_ws_disconnect() {
    metrics::gauge!("tagwire_connections_active").decrement(1.0);
}

pub fn record_pending_count(n: usize) {
    metrics::gauge!("tagwire_connections_pending").set(n as f64);
}

pub fn record_subscriber_count(n: usize) {
    metrics::gauge!("tagwire_hub_subscribers").set(n as f64);
}

pub fn record_session_count(n: usize) {
    metrics::gauge!("tagwire_sessions").set(n as f64);
}

/// Record a broadcast of the given message kind.
pub fn record_broadcast(what: &'static str) {
    metrics::counter!("tagwire_broadcasts_total", "what" => what).increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &'static str) {
    metrics::counter!("tagwire_errors_total", "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_without_recorder_does_not_panic() {
        record_ws_connect();
        record_ws_disconnect();
        record_pending_count(3);
        record_broadcast("Inner");
        record_error("queue_overflow");
    }

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_install_prometheus_recorder() {
        // only one recorder per process; another test may have won
        if let Ok(handle) = install_prometheus_recorder() {
            record_error("test_error");
            assert!(handle.render().contains("tagwire_errors_total"));
        }
    }
}
