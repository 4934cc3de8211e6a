//! Per-connection context and structured connection events.

use crate::rules::Rule;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Monotonic source of connection ids, one per gateway.
#[derive(Debug, Default)]
pub struct ConnectionIds(AtomicU64);

impl ConnectionIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Direction or status of a connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    Open,
    ClientToUpstream,
    UpstreamToClient,
    Close,
    Fallback,
    ConnectFailed,
}

impl EventCode {
    pub fn as_str(self) -> &'static str {
        match self {
            EventCode::Open => "OPEN",
            EventCode::ClientToUpstream => "CLIENT_TO_UPSTREAM",
            EventCode::UpstreamToClient => "UPSTREAM_TO_CLIENT",
            EventCode::Close => "CLOSE",
            EventCode::Fallback => "FALLBACK",
            EventCode::ConnectFailed => "CONNECT_FAILED",
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic comment attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventComment {
    ConnectionReset,
    OperationTimeout,
    IoError,
    NoRoute,
    Empty,
}

impl EventComment {
    pub fn as_str(self) -> &'static str {
        match self {
            EventComment::ConnectionReset => "CONNECTION_RESET",
            EventComment::OperationTimeout => "OPERATION_TIMEOUT",
            EventComment::IoError => "IO_ERROR",
            EventComment::NoRoute => "NO_ROUTE",
            EventComment::Empty => "EMPTY",
        }
    }
}

impl fmt::Display for EventComment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State carried by one accepted connection.
///
/// The resolved rule is fixed once routing completes; later reloads do not
/// affect it. Byte counters are the only state kept after close.
#[derive(Debug)]
pub struct ConnectionContext {
    pub id: u64,
    pub listener: String,
    pub peer: String,
    pub rule: Option<Arc<Rule>>,
    pub bytes_client_to_upstream: u64,
    pub bytes_upstream_to_client: u64,
    started: Instant,
}

impl ConnectionContext {
    pub fn new(id: u64, listener: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            id,
            listener: listener.into(),
            peer: peer.into(),
            rule: None,
            bytes_client_to_upstream: 0,
            bytes_upstream_to_client: 0,
            started: Instant::now(),
        }
    }

    pub fn bind_rule(&mut self, rule: Arc<Rule>) {
        self.rule = Some(rule);
    }

    pub fn target(&self) -> Option<&str> {
        self.rule.as_ref().map(|rule| rule.target.addr())
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Emit a structured event for this connection.
    pub fn emit(&self, code: EventCode, bytes: u64, comment: Option<EventComment>) {
        let comment = comment.map(EventComment::as_str).unwrap_or("");
        match code {
            EventCode::ConnectFailed => warn!(
                target: "harbr_gateway::events",
                conn_id = self.id,
                code = code.as_str(),
                bytes,
                comment,
                target_addr = self.target().unwrap_or("-"),
                "connection event"
            ),
            _ => info!(
                target: "harbr_gateway::events",
                conn_id = self.id,
                code = code.as_str(),
                bytes,
                comment,
                "connection event"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyRuleConfig;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let ids = ConnectionIds::new();
        let first = ids.next();
        let second = ids.next();
        assert!(second > first);
    }

    #[test]
    fn test_codes_render_as_wire_names() {
        assert_eq!(EventCode::ClientToUpstream.to_string(), "CLIENT_TO_UPSTREAM");
        assert_eq!(EventComment::OperationTimeout.to_string(), "OPERATION_TIMEOUT");
    }

    #[test]
    fn test_bound_rule_fixes_target() {
        let mut ctx = ConnectionContext::new(7, "127.0.0.1:7000", "127.0.0.1:5555");
        assert!(ctx.target().is_none());

        ctx.bind_rule(Arc::new(Rule::from_proxy_config(&ProxyRuleConfig {
            tls: false,
            sni: None,
            tls_cert_path: None,
            tls_key_path: None,
            listen_addr: "127.0.0.1:7000".to_string(),
            target_addr: "backend:80".to_string(),
            priority: 0,
        })));
        assert_eq!(ctx.target(), Some("backend:80"));
        ctx.emit(EventCode::Open, 0, None);
    }
}
