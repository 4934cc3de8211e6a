//! Listener services.
//!
//! Each listener address runs exactly one kind of service, fixed by the rules
//! that name it. The set of kinds is closed, so dispatch is a plain enum.

use crate::classify::read_first_chunk;
use crate::config::{FallbackResponse, ListenerKind, Settings};
use crate::connection::{ConnectionContext, ConnectionIds, EventCode, EventComment};
use crate::connector::ConnectorCache;
use crate::forwarder::{DuplexForwarder, RelayOutcome};
use crate::store::SharedRuleStore;
use crate::tls::TlsAcceptorCache;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::debug;

pub mod http;
pub mod tcp;

pub use http::GatewayService;
pub use tcp::ProxyService;

/// Everything a connection task needs, shared by all listeners.
pub struct ServiceContext {
    pub store: SharedRuleStore,
    pub settings: Settings,
    pub connectors: ConnectorCache,
    pub tls: TlsAcceptorCache,
    pub forwarder: DuplexForwarder,
    pub ids: ConnectionIds,
    reload_requests: Notify,
}

impl ServiceContext {
    pub fn new(store: SharedRuleStore, settings: Settings) -> Self {
        Self {
            connectors: ConnectorCache::new(settings.connect_timeout()),
            tls: TlsAcceptorCache::new(),
            forwarder: DuplexForwarder::new(settings.buffer_size, settings.read_timeout()),
            ids: ConnectionIds::new(),
            reload_requests: Notify::new(),
            store,
            settings,
        }
    }

    /// Ask the reload task for an early, interval-gated check.
    pub fn request_reload(&self) {
        self.reload_requests.notify_one();
    }

    /// Resolves once [`request_reload`](Self::request_reload) has been called.
    pub async fn reload_requested(&self) {
        self.reload_requests.notified().await;
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The client closed before sending anything.
    Empty,
    /// The client stayed silent past the read deadline.
    TimedOut,
    /// Bytes were relayed to the resolved target.
    Relayed(RelayOutcome),
    /// No rule matched; the fallback was applied.
    Fallback(FallbackResponse),
    /// Requests were served by the HTTP engine.
    Served,
    /// The resolved target could not be reached.
    UpstreamFailed,
    /// The connection failed before routing completed.
    Aborted,
}

/// One read of the first chunk, bounded by the read deadline.
///
/// `Err` carries the outcome of a connection that ended before anything
/// could be classified.
pub(crate) async fn read_first<S>(
    ctx: &ServiceContext,
    conn: &ConnectionContext,
    stream: &mut S,
) -> Result<Bytes, ConnectionOutcome>
where
    S: AsyncRead + Unpin,
{
    let read = timeout(ctx.settings.read_timeout(), read_first_chunk(stream, ctx.settings.buffer_size)).await;
    match read {
        Ok(Ok(chunk)) if chunk.is_empty() => {
            conn.emit(EventCode::Close, 0, Some(EventComment::Empty));
            Err(ConnectionOutcome::Empty)
        }
        Ok(Ok(chunk)) => Ok(chunk.freeze()),
        Ok(Err(e)) => {
            debug!(conn_id = conn.id, error = %e, "Initial read failed");
            Err(ConnectionOutcome::Aborted)
        }
        Err(_) => {
            conn.emit(EventCode::Close, 0, Some(EventComment::OperationTimeout));
            Err(ConnectionOutcome::TimedOut)
        }
    }
}

#[derive(Debug, Clone)]
pub enum Service {
    Proxy(ProxyService),
    Gateway(GatewayService),
}

impl Service {
    pub fn new(kind: ListenerKind, listen_key: impl Into<String>) -> Self {
        match kind {
            ListenerKind::Proxy => Service::Proxy(ProxyService::new(listen_key)),
            ListenerKind::Gateway => Service::Gateway(GatewayService::new(listen_key)),
        }
    }

    pub fn kind(&self) -> ListenerKind {
        match self {
            Service::Proxy(_) => ListenerKind::Proxy,
            Service::Gateway(_) => ListenerKind::Gateway,
        }
    }

    pub fn listen_key(&self) -> &str {
        match self {
            Service::Proxy(service) => service.listen_key(),
            Service::Gateway(service) => service.listen_key(),
        }
    }

    pub async fn handle<S>(&self, ctx: &Arc<ServiceContext>, conn: &mut ConnectionContext, stream: S) -> ConnectionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self {
            Service::Proxy(service) => service.handle(ctx, conn, stream).await,
            Service::Gateway(service) => service.handle(ctx, conn, stream).await,
        }
    }
}
