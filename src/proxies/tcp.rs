//! Proxy service: classify, identify, match, then relay raw bytes.
//!
//! TLS connections are routed by SNI and relayed untouched unless the
//! matched rule carries a certificate, in which case TLS is terminated here
//! and the decrypted stream is relayed. Plaintext connections are routed by
//! their `Host` header.

use super::{read_first, ConnectionOutcome, ServiceContext};
use crate::classify::classify;
use crate::connection::{ConnectionContext, EventCode};
use crate::fallback::{self, FallbackReason};
use crate::rules::{ProxyRoute, Rule, RuleKind};
use crate::sni::{extract_host, extract_sni};
use crate::stream::PrefixedStream;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ProxyService {
    listen_key: String,
}

impl ProxyService {
    pub fn new(listen_key: impl Into<String>) -> Self {
        Self {
            listen_key: listen_key.into(),
        }
    }

    pub fn listen_key(&self) -> &str {
        &self.listen_key
    }

    pub fn resolve(&self, ctx: &ServiceContext, tls: bool, identity: Option<&str>) -> Option<Arc<Rule>> {
        ctx.store.resolve(&self.listen_key, tls, identity, None)
    }

    pub async fn handle<S>(&self, ctx: &Arc<ServiceContext>, conn: &mut ConnectionContext, mut stream: S) -> ConnectionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let first = match read_first(ctx, conn, &mut stream).await {
            Ok(first) => first,
            Err(outcome) => return outcome,
        };

        let kind = classify(&first);
        let tls = kind.is_tls();
        let identity = if tls { extract_sni(&first) } else { extract_host(&first) };
        debug!(conn_id = conn.id, kind = kind.as_str(), identity = ?identity, "Classified connection");

        let rule = match self.resolve(ctx, tls, identity.as_deref()) {
            Some(rule) => rule,
            None => {
                let reason = if identity.is_some() {
                    FallbackReason::ProxyUnmatched
                } else {
                    FallbackReason::ProxyMissingIdentity
                };
                let response = ctx.settings.fallback.select(reason);
                if let Err(e) = fallback::respond(&mut stream, conn, response, tls).await {
                    debug!(conn_id = conn.id, error = %e, "Fallback write failed");
                }
                return ConnectionOutcome::Fallback(response);
            }
        };
        conn.bind_rule(Arc::clone(&rule));

        let upstream = match ctx.connectors.connect(&rule.target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                conn.emit(EventCode::ConnectFailed, 0, None);
                e.log("Proxy upstream");
                return ConnectionOutcome::UpstreamFailed;
            }
        };

        // The sniffed bytes go first, to the TLS acceptor or straight upstream.
        let client = PrefixedStream::new(first, stream);

        let terminate = match &rule.kind {
            RuleKind::Proxy(ProxyRoute {
                tls_identity: Some((cert, key)),
            }) if tls => Some((cert.as_str(), key.as_str())),
            _ => None,
        };

        let Some((cert, key)) = terminate else {
            return ConnectionOutcome::Relayed(ctx.forwarder.relay(conn, client, upstream).await);
        };

        let acceptor = match ctx.tls.acceptor(cert, key) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                e.log("TLS acceptor");
                return ConnectionOutcome::Aborted;
            }
        };

        match timeout(ctx.forwarder.read_timeout(), acceptor.accept(client)).await {
            Ok(Ok(tls_stream)) => {
                ConnectionOutcome::Relayed(ctx.forwarder.relay(conn, tls_stream, upstream).await)
            }
            Ok(Err(e)) => {
                warn!(conn_id = conn.id, error = %e, "TLS handshake failed");
                ConnectionOutcome::Aborted
            }
            Err(_) => {
                warn!(conn_id = conn.id, "TLS handshake timed out");
                ConnectionOutcome::Aborted
            }
        }
    }
}
