//! First-chunk stream classification.

use crate::buffers;
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record content type for handshake messages.
pub const TLS_HANDSHAKE: u8 = 0x16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tls,
    WebSocketUpgrade,
    PlainHttp,
}

impl StreamKind {
    pub fn is_tls(self) -> bool {
        self == StreamKind::Tls
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Tls => "tls",
            StreamKind::WebSocketUpgrade => "websocket",
            StreamKind::PlainHttp => "http",
        }
    }
}

/// Classify the first bytes of a connection.
///
/// Partial data is classified on a best-effort basis.
pub fn classify(data: &[u8]) -> StreamKind {
    if data.first() == Some(&TLS_HANDSHAKE) {
        return StreamKind::Tls;
    }

    let text = String::from_utf8_lossy(data);
    let upgrade = text.lines().any(|line| {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        name.trim().eq_ignore_ascii_case("upgrade") && value.trim().eq_ignore_ascii_case("websocket")
    });

    if upgrade {
        StreamKind::WebSocketUpgrade
    } else {
        StreamKind::PlainHttp
    }
}

/// Perform exactly one read of at most `max_bytes` from a fresh connection.
///
/// An empty buffer means the client closed without sending anything.
pub async fn read_first_chunk<R>(stream: &mut R, max_bytes: usize) -> io::Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = buffers::chunk(max_bytes);
    let n = stream.read(&mut buffer[..]).await?;
    buffer.truncate(n);
    Ok(buffer)
}
