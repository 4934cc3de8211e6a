//! Shared upstream connectors.
//!
//! HTTP clients are pooled per target in a [`DashMap`]; a client is cloned
//! out of the map before any request is sent, so no shard lock is ever held
//! across a network operation.

use crate::error::{GatewayError, Result};
use crate::rules::{RuleTable, Target};
use dashmap::DashMap;
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use metrics::counter;
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

pub type HttpClient = Client<HttpConnector, Body>;

pub struct ConnectorCache {
    clients: DashMap<String, HttpClient>,
    connect_timeout: Duration,
}

impl ConnectorCache {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout,
        }
    }

    /// Pooled HTTP client for `target`.
    pub fn http_client(&self, target: &Target) -> HttpClient {
        if let Some(client) = self.clients.get(target.addr()) {
            return client.value().clone();
        }

        self.clients
            .entry(target.addr().to_string())
            .or_insert_with(|| {
                debug!(target_addr = %target, "Creating upstream HTTP client");
                let mut connector = HttpConnector::new();
                connector.set_connect_timeout(Some(self.connect_timeout));
                connector.set_nodelay(true);
                Client::builder().build(connector)
            })
            .value()
            .clone()
    }

    /// Open a raw TCP connection to `target` within the connect timeout.
    pub async fn connect(&self, target: &Target) -> Result<TcpStream> {
        let result = match timeout(self.connect_timeout, TcpStream::connect(target.addr())).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.connect_timeout)),
        };

        match result {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Err(reason) => {
                counter!("gateway.upstream.connect_failed", 1);
                warn!(target_addr = %target, %reason, "Upstream connect failed");
                Err(GatewayError::upstream(target.addr(), reason))
            }
        }
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    /// Drop pooled clients whose target no rule in `table` names.
    pub fn retain_targets(&self, table: &RuleTable) -> usize {
        let live: HashSet<&str> = table.targets().map(Target::addr).collect();
        let before = self.clients.len();
        self.clients.retain(|addr, _| live.contains(addr.as_str()));
        before.saturating_sub(self.clients.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyRuleConfig;
    use crate::rules::Rule;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_listening_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new(listener.local_addr().unwrap().to_string());
        let cache = ConnectorCache::new(Duration::from_secs(1));

        let stream = cache.connect(&target).await.unwrap();
        let (_accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_connect_failure_is_upstream_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cache = ConnectorCache::new(Duration::from_secs(1));
        let err = cache.connect(&Target::new(addr.to_string())).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_http_clients_are_reused_per_target() {
        let cache = ConnectorCache::new(Duration::from_secs(1));
        let a = Target::new("127.0.0.1:9001");
        let b = Target::new("127.0.0.1:9002");

        let _ = cache.http_client(&a);
        let _ = cache.http_client(&a);
        let _ = cache.http_client(&b);
        assert_eq!(cache.cached_clients(), 2);
    }

    #[tokio::test]
    async fn test_clients_for_removed_targets_are_pruned() {
        let cache = ConnectorCache::new(Duration::from_secs(1));
        let _ = cache.http_client(&Target::new("127.0.0.1:9001"));
        let _ = cache.http_client(&Target::new("127.0.0.1:9002"));

        let table = RuleTable::from_rules(vec![Rule::from_proxy_config(&ProxyRuleConfig {
            tls: false,
            sni: None,
            tls_cert_path: None,
            tls_key_path: None,
            listen_addr: "127.0.0.1:7000".to_string(),
            target_addr: "127.0.0.1:9002".to_string(),
            priority: 0,
        })]);

        assert_eq!(cache.retain_targets(&table), 1);
        assert_eq!(cache.cached_clients(), 1);
        assert_eq!(cache.retain_targets(&table), 0);
    }
}
