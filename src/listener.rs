//! Accept loops.
//!
//! One task per accepted connection. A per-listener semaphore bounds the
//! number of live connections; once the accept loop stops, the listener
//! waits for in-flight connections to drain before returning.

use crate::config::ListenerKind;
use crate::connection::{ConnectionContext, EventCode};
use crate::error::{GatewayError, Result};
use crate::proxies::{Service, ServiceContext};
use metrics::counter;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub struct Listener {
    listener: TcpListener,
    service: Service,
    ctx: Arc<ServiceContext>,
    limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind `listen_key` and serve it with the service of `kind`.
    pub async fn bind(listen_key: &str, kind: ListenerKind, ctx: Arc<ServiceContext>) -> Result<Self> {
        let listener = TcpListener::bind(listen_key).await.map_err(|e| GatewayError::Bind {
            address: listen_key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_listener(listen_key, kind, listener, ctx))
    }

    /// Serve an already bound socket. Rules are looked up by `listen_key`.
    pub fn from_listener(
        listen_key: &str,
        kind: ListenerKind,
        listener: TcpListener,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        let max_connections = ctx.settings.max_connections.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            listener,
            service: Service::new(kind, listen_key),
            limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            ctx,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn listen_key(&self) -> &str {
        self.service.listen_key()
    }

    pub fn kind(&self) -> ListenerKind {
        self.service.kind()
    }

    /// Accept until `shutdown` resolves, then drain in-flight connections.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.local_addr()?;
        info!(listener = self.listen_key(), %local_addr, kind = ?self.kind(), "Listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning.
                        error!(listener = self.listen_key(), error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        info!(listener = self.listen_key(), "Stopped accepting, draining connections");
        let permits = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        let drain = timeout(self.ctx.forwarder.read_timeout(), self.limit.acquire_many(permits)).await;
        if drain.is_err() {
            warn!(listener = self.listen_key(), "Connections still open after drain timeout");
        }
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let permit = match Arc::clone(&self.limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                counter!("gateway.connections.rejected", 1);
                warn!(listener = self.listen_key(), %peer, "Connection limit reached, refusing connection");
                return;
            }
        };
        counter!("gateway.connections.accepted", 1);

        self.ctx.request_reload();

        let _ = stream.set_nodelay(true);
        let id = self.ctx.ids.next();
        let service = self.service.clone();
        let ctx = Arc::clone(&self.ctx);
        let span = info_span!("connection", id, peer = %peer);

        tokio::spawn(
            async move {
                let _permit = permit;
                let mut conn = ConnectionContext::new(id, service.listen_key(), peer.to_string());
                conn.emit(EventCode::Open, 0, None);
                let outcome = service.handle(&ctx, &mut conn, stream).await;
                debug!(?outcome, target_addr = conn.target().unwrap_or("-"), "Connection finished");
            }
            .instrument(span),
        );
    }
}
