use crate::config::MetricsConfig;
use anyhow::{Context, Result};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter when enabled.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid metrics listen address '{}'", config.listen_addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    describe_metrics();
    tracing::info!("Metrics exporter listening on {}", addr);
    Ok(())
}

fn describe_metrics() {
    describe_counter!("gateway.connections.accepted", "Connections accepted by all listeners");
    describe_counter!("gateway.connections.rejected", "Connections refused at the connection limit");
    describe_counter!("gateway.connections.closed", "Relayed connections by terminal state");
    describe_counter!("gateway.bytes", Unit::Bytes, "Bytes relayed by direction");
    describe_counter!("gateway.fallback", "Unroutable connections by fallback response");
    describe_counter!("gateway.upstream.connect_failed", "Failed upstream connection attempts");
    describe_counter!("gateway.relay.timeout", "Relays ended by the read deadline");
    describe_counter!("gateway.reload.applied", "Configuration versions applied");
    describe_counter!("gateway.reload.failed", "Configuration versions rejected");
    describe_counter!("gateway.http.requests", "Gateway HTTP requests by status");
    describe_histogram!("gateway.connection.duration", Unit::Seconds, "Relayed connection lifetime");
    describe_histogram!("gateway.http.request.duration", Unit::Seconds, "Gateway HTTP request latency");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_install_nothing() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_bad_listen_address_is_rejected() {
        let config = MetricsConfig {
            enabled: true,
            listen_addr: "not-an-address".to_string(),
        };
        assert!(init_metrics(&config).is_err());
    }
}
