//! Stream adapters.
//!
//! [`PrefixedStream`] hands bytes consumed while classifying a connection
//! back to whoever reads the stream next (an upstream relay, the TLS acceptor
//! or the HTTP engine), ahead of anything still buffered in the socket.
//! [`MeteredStream`] counts bytes and tracks idleness for connections whose
//! I/O is driven by the HTTP engine rather than the forwarder.

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes not yet handed to a reader.
    pub fn pending_prefix(&self) -> &[u8] {
        &self.prefix
    }

}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.prefix.has_remaining() && buf.remaining() > 0 {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Byte counters and last-activity time shared with a [`MeteredStream`].
#[derive(Debug)]
pub struct StreamActivity {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    in_flight: AtomicUsize,
    last_active: Mutex<Instant>,
}

impl StreamActivity {
    pub fn new() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Time since the last byte moved. Zero while a request is in flight.
    pub fn idle_for(&self) -> Duration {
        if self.in_flight.load(Ordering::Acquire) > 0 {
            return Duration::ZERO;
        }
        self.last_active.lock().elapsed()
    }

    /// Mark a request as in flight until the guard drops.
    pub fn begin_request(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(Arc::clone(self))
    }
}

impl Default for StreamActivity {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlight(Arc<StreamActivity>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.touch();
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct MeteredStream<S> {
    inner: S,
    activity: Arc<StreamActivity>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, activity: Arc<StreamActivity>) -> Self {
        Self { inner, activity }
    }

    fn record_write(&self, poll: &Poll<io::Result<usize>>) {
        if let Poll::Ready(Ok(n)) = poll {
            if *n > 0 {
                self.activity.bytes_written.fetch_add(*n as u64, Ordering::Relaxed);
                self.activity.touch();
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        let n = buf.filled().len() - before;
        if n > 0 {
            this.activity.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
            this.activity.touch();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.record_write(&poll);
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.record_write(&poll);
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_is_read_before_inner() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), server);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert!(stream.pending_prefix().is_empty());
    }

    #[tokio::test]
    async fn test_small_reads_drain_prefix_in_pieces() {
        let (_client, server) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"abcdef"), server);

        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_writes_go_to_inner() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(Bytes::new(), server);
        stream.write_all(b"pong").await.unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_full_read_buffer_does_not_look_like_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"!").await.unwrap();
        let mut stream = PrefixedStream::new(Bytes::from_static(b"ab"), server);

        let mut storage = [0u8; 0];
        let mut empty = ReadBuf::new(&mut storage);
        let polled = poll_read_once(&mut stream, &mut empty).await;
        assert!(polled.is_ok());
        assert_eq!(stream.pending_prefix(), b"ab");

        let mut out = [0u8; 3];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ab!");
    }

    async fn poll_read_once<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut ReadBuf<'_>) -> io::Result<()> {
        std::future::poll_fn(|cx| Pin::new(&mut *stream).poll_read(cx, buf)).await
    }

    #[tokio::test]
    async fn test_metered_stream_counts_both_directions() {
        let (mut client, server) = tokio::io::duplex(64);
        let activity = Arc::new(StreamActivity::new());
        let mut stream = MeteredStream::new(server, Arc::clone(&activity));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"pong!").await.unwrap();

        assert_eq!(activity.bytes_read(), 4);
        assert_eq!(activity.bytes_written(), 5);
    }

    #[test]
    fn test_in_flight_request_is_never_idle() {
        let activity = Arc::new(StreamActivity::new());
        std::thread::sleep(Duration::from_millis(20));
        assert!(activity.idle_for() >= Duration::from_millis(20));

        let guard = activity.begin_request();
        assert_eq!(activity.idle_for(), Duration::ZERO);
        drop(guard);
        assert!(activity.idle_for() < Duration::from_millis(20));
    }
}
