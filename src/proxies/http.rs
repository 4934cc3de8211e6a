//! Gateway service: path-routed HTTP with capture-group rewriting.
//!
//! Plain requests are parsed by hyper and forwarded through pooled clients
//! with their target rewritten. WebSocket upgrades are matched on the request
//! line, the line is rewritten, and the connection is then relayed raw.

use super::{read_first, ConnectionOutcome, ServiceContext};
use crate::classify::{classify, StreamKind};
use crate::connection::{ConnectionContext, EventCode, EventComment};
use crate::error::GatewayError;
use crate::fallback::{self, FallbackReason};
use crate::rewrite::split_path_and_query;
use crate::rules::{normalize_hostname, Rule};
use crate::sni::{extract_host, RequestLine};
use crate::stream::{MeteredStream, PrefixedStream, StreamActivity};
use bytes::{Bytes, BytesMut};
use hyper::header::HOST;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode, Uri};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct GatewayService {
    listen_key: String,
}

impl GatewayService {
    pub fn new(listen_key: impl Into<String>) -> Self {
        Self {
            listen_key: listen_key.into(),
        }
    }

    pub fn listen_key(&self) -> &str {
        &self.listen_key
    }

    /// Gateway listeners only route plaintext requests.
    pub fn resolve(
        &self,
        ctx: &ServiceContext,
        tls: bool,
        host: Option<&str>,
        path: Option<&str>,
    ) -> Option<Arc<Rule>> {
        if tls {
            return None;
        }
        ctx.store.resolve(&self.listen_key, false, host, path)
    }

    pub async fn handle<S>(&self, ctx: &Arc<ServiceContext>, conn: &mut ConnectionContext, mut stream: S) -> ConnectionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let first = match read_first(ctx, conn, &mut stream).await {
            Ok(first) => first,
            Err(outcome) => return outcome,
        };

        match classify(&first) {
            StreamKind::Tls => {
                let response = ctx.settings.fallback.select(FallbackReason::HttpUnmatched);
                if let Err(e) = fallback::respond(&mut stream, conn, response, true).await {
                    debug!(conn_id = conn.id, error = %e, "Fallback write failed");
                }
                ConnectionOutcome::Fallback(response)
            }
            StreamKind::WebSocketUpgrade => self.relay_upgrade(ctx, conn, first, stream).await,
            StreamKind::PlainHttp => self.serve_http(ctx, conn, first, stream).await,
        }
    }

    async fn relay_upgrade<S>(
        &self,
        ctx: &Arc<ServiceContext>,
        conn: &mut ConnectionContext,
        first: Bytes,
        mut stream: S,
    ) -> ConnectionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let line = RequestLine::parse(&first);
        let host = extract_host(&first);
        let matched = line.as_ref().and_then(|line| {
            let (path, query) = split_path_and_query(&line.target);
            let rule = self.resolve(ctx, false, host.as_deref(), Some(path))?;
            let rewritten = rule.rewrite_path(path, query)?;
            Some((rule, line, rewritten))
        });

        let Some((rule, line, rewritten)) = matched else {
            let response = ctx.settings.fallback.select(FallbackReason::HttpUnmatched);
            if let Err(e) = fallback::respond(&mut stream, conn, response, false).await {
                debug!(conn_id = conn.id, error = %e, "Fallback write failed");
            }
            return ConnectionOutcome::Fallback(response);
        };
        conn.bind_rule(Arc::clone(&rule));
        debug!(conn_id = conn.id, from = %line.target, to = %rewritten, "Rewrote upgrade request");

        let upstream = match ctx.connectors.connect(&rule.target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                conn.emit(EventCode::ConnectFailed, 0, None);
                e.log("WebSocket upstream");
                return ConnectionOutcome::UpstreamFailed;
            }
        };

        let head = rewrite_request_line(&first, line, rewritten);
        let client = PrefixedStream::new(head, stream);
        ConnectionOutcome::Relayed(ctx.forwarder.relay(conn, client, upstream).await)
    }

    async fn serve_http<S>(
        &self,
        ctx: &Arc<ServiceContext>,
        conn: &mut ConnectionContext,
        first: Bytes,
        stream: S,
    ) -> ConnectionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let activity = Arc::new(StreamActivity::new());
        let client = MeteredStream::new(PrefixedStream::new(first, stream), Arc::clone(&activity));
        let service = self.clone();
        let request_activity = Arc::clone(&activity);
        let handler_ctx = Arc::clone(ctx);
        let (id, listener, peer) = (conn.id, conn.listener.clone(), conn.peer.clone());

        let handler = service_fn(move |req| {
            let service = service.clone();
            let ctx = Arc::clone(&handler_ctx);
            let request_ctx = ConnectionContext::new(id, listener.clone(), peer.clone());
            let in_flight = request_activity.begin_request();
            async move {
                let _in_flight = in_flight;
                service.forward_request(&ctx, request_ctx, req).await
            }
        });

        let connection = Http::new().http1_only(true).serve_connection(client, handler);
        tokio::pin!(connection);

        // Idle keep-alive and stalled request heads share the read deadline.
        let idle_limit = ctx.settings.read_timeout();
        let mut comment = None;
        loop {
            let idle = activity.idle_for();
            if idle >= idle_limit {
                debug!(conn_id = conn.id, "HTTP connection idle past read timeout");
                counter!("gateway.relay.timeout", 1);
                comment = Some(EventComment::OperationTimeout);
                break;
            }

            tokio::select! {
                result = &mut connection => {
                    match result {
                        Ok(()) => {}
                        Err(e) if e.is_incomplete_message() || e.is_closed() => {
                            debug!(conn_id = conn.id, error = %e, "Client went away")
                        }
                        Err(e) => debug!(conn_id = conn.id, error = %e, "HTTP connection ended with error"),
                    }
                    break;
                }
                _ = tokio::time::sleep(idle_limit - idle) => {}
            }
        }

        conn.bytes_client_to_upstream = activity.bytes_read();
        conn.bytes_upstream_to_client = activity.bytes_written();
        conn.emit(EventCode::ClientToUpstream, conn.bytes_client_to_upstream, None);
        conn.emit(EventCode::UpstreamToClient, conn.bytes_upstream_to_client, None);
        conn.emit(
            EventCode::Close,
            conn.bytes_client_to_upstream + conn.bytes_upstream_to_client,
            comment,
        );
        if comment.is_some() {
            ConnectionOutcome::TimedOut
        } else {
            ConnectionOutcome::Served
        }
    }

    /// Route one parsed request, rewrite its target and forward it.
    async fn forward_request(
        &self,
        ctx: &ServiceContext,
        mut conn: ConnectionContext,
        mut req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        let start = Instant::now();
        let host = req
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| req.uri().host())
            .map(normalize_hostname);
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let rewritten = self
            .resolve(ctx, false, host.as_deref(), Some(&path))
            .and_then(|rule| {
                let rewritten = rule.rewrite_path(&path, query.as_deref())?;
                Some((rule, rewritten))
            });

        let Some((rule, rewritten)) = rewritten else {
            let response = ctx.settings.fallback.select(FallbackReason::HttpUnmatched);
            counter!("gateway.http.requests", 1, "status" => "fallback");
            // A `close` policy drops the connection by failing the request.
            return fallback::http_response(&conn, response).ok_or(GatewayError::NoMatchingRule {
                listener: self.listen_key.clone(),
                identity: host,
            });
        };
        conn.bind_rule(Arc::clone(&rule));

        let uri: Uri = format!("http://{}{}", rule.target.addr(), rewritten)
            .parse()
            .map_err(|e| GatewayError::upstream(rule.target.addr(), e))?;
        debug!(conn_id = conn.id, path = %path, upstream = %uri, "Forwarding request");
        *req.uri_mut() = uri;

        let client = ctx.connectors.http_client(&rule.target);
        let response = match timeout(ctx.settings.read_timeout(), client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                conn.emit(EventCode::ConnectFailed, 0, None);
                error_response(&GatewayError::upstream(rule.target.addr(), e))
            }
            Err(elapsed) => {
                warn!(conn_id = conn.id, upstream = %rule.target, "Upstream request timed out");
                error_response(&GatewayError::from(elapsed))
            }
        };

        let status = response.status().as_u16().to_string();
        counter!("gateway.http.requests", 1, "status" => status);
        histogram!("gateway.http.request.duration", start.elapsed().as_secs_f64());
        Ok(response)
    }
}

fn error_response(error: &GatewayError) -> Response<Body> {
    error.log("Gateway request");
    let status = StatusCode::from_u16(error.http_status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(status.canonical_reason().unwrap_or("").to_string()));
    *response.status_mut() = status;
    response
}

/// Replace the request line of a sniffed request head, keeping every byte after it.
fn rewrite_request_line(first: &Bytes, line: &RequestLine, target: String) -> Bytes {
    let rest = RequestLine::encoded_len(first)
        .map(|len| first.slice(len..))
        .unwrap_or_default();
    let rewritten = RequestLine {
        target,
        ..line.clone()
    };

    let encoded = rewritten.encode();
    let mut head = BytesMut::with_capacity(encoded.len() + rest.len());
    head.extend_from_slice(encoded.as_bytes());
    head.extend_from_slice(&rest);
    head.freeze()
}
