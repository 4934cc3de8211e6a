//! Default fallback for connections no rule accepts.
//!
//! Plaintext connections receive a canned HTTP response. TLS connections
//! cannot read one, so they receive a fatal TLS alert instead.

use crate::config::{FallbackPolicy, FallbackResponse};
use crate::connection::{ConnectionContext, EventCode, EventComment};
use hyper::{Body, Response, StatusCode};
use metrics::counter;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

const NOT_FOUND: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\nConnection: close\r\n\r\nNot Found";
const SERVER_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/plain\r\nContent-Length: 21\r\nConnection: close\r\n\r\nInternal Server Error";

/// Alert record: type 21, version, length 2, level fatal, description.
const ALERT_UNRECOGNIZED_NAME: &[u8] = &[0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 112];
const ALERT_INTERNAL_ERROR: &[u8] = &[0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 80];

/// Why a connection ended up in the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// Gateway listener, no rule for the request's host and path.
    HttpUnmatched,
    /// Proxy listener, an identity was found but no rule accepted it.
    ProxyUnmatched,
    /// Proxy listener, no identity and no catch-all.
    ProxyMissingIdentity,
}

impl FallbackPolicy {
    pub fn select(&self, reason: FallbackReason) -> FallbackResponse {
        match reason {
            FallbackReason::HttpUnmatched => self.http_unmatched,
            FallbackReason::ProxyUnmatched => self.proxy_unmatched,
            FallbackReason::ProxyMissingIdentity => self.proxy_missing_identity,
        }
    }
}

impl FallbackResponse {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackResponse::NotFound => "not_found",
            FallbackResponse::ServerError => "server_error",
            FallbackResponse::Close => "close",
        }
    }

    pub fn status(self) -> Option<StatusCode> {
        match self {
            FallbackResponse::NotFound => Some(StatusCode::NOT_FOUND),
            FallbackResponse::ServerError => Some(StatusCode::INTERNAL_SERVER_ERROR),
            FallbackResponse::Close => None,
        }
    }

    /// Raw bytes written to the client, if any.
    pub fn payload(self, tls: bool) -> Option<&'static [u8]> {
        match (self, tls) {
            (FallbackResponse::NotFound, false) => Some(NOT_FOUND),
            (FallbackResponse::ServerError, false) => Some(SERVER_ERROR),
            (FallbackResponse::NotFound, true) => Some(ALERT_UNRECOGNIZED_NAME),
            (FallbackResponse::ServerError, true) => Some(ALERT_INTERNAL_ERROR),
            (FallbackResponse::Close, _) => None,
        }
    }
}

fn record(ctx: &ConnectionContext, response: FallbackResponse) {
    counter!("gateway.fallback", 1, "response" => response.as_str());
    ctx.emit(EventCode::Fallback, 0, Some(EventComment::NoRoute));
    debug!(conn_id = ctx.id, response = response.as_str(), "No route, using fallback");
}

/// Answer an unroutable raw connection and close it.
pub async fn respond<W>(writer: &mut W, ctx: &ConnectionContext, response: FallbackResponse, tls: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    record(ctx, response);
    if let Some(payload) = response.payload(tls) {
        writer.write_all(payload).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

/// Answer an unroutable request inside the HTTP engine.
///
/// `None` means the connection should be dropped without a response.
pub fn http_response(ctx: &ConnectionContext, response: FallbackResponse) -> Option<Response<Body>> {
    record(ctx, response);
    let status = response.status()?;
    let body = status.canonical_reason().unwrap_or("").to_string();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .ok()
}
