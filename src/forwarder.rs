//! Duplex forwarder.
//!
//! Relays bytes between a client and an upstream transport until either side
//! closes, fails, or stays silent past the read deadline. Each direction owns
//! exactly one fixed-size chunk, so memory per connection is bounded no
//! matter how fast either side produces data.

use crate::buffers;
use crate::connection::{ConnectionContext, EventCode, EventComment};
use metrics::{counter, histogram};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Upstream => "upstream",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic class of a relay I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ConnectionReset,
    TimedOut,
    Other,
}

impl ErrorClass {
    pub fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ErrorClass::ConnectionReset,
            io::ErrorKind::TimedOut => ErrorClass::TimedOut,
            _ => ErrorClass::Other,
        }
    }

    pub fn comment(self) -> EventComment {
        match self {
            ErrorClass::ConnectionReset => EventComment::ConnectionReset,
            ErrorClass::TimedOut => EventComment::OperationTimeout,
            ErrorClass::Other => EventComment::IoError,
        }
    }
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// `side` closed its end in an orderly way.
    ClosedClean { side: Side },
    /// An I/O operation on `side` failed.
    ClosedError { side: Side, class: ErrorClass },
    /// `side` produced nothing within the read deadline.
    ClosedTimeout { side: Side },
}

impl TerminalState {
    pub fn label(&self) -> &'static str {
        match self {
            TerminalState::ClosedClean { .. } => "clean",
            TerminalState::ClosedError { .. } => "error",
            TerminalState::ClosedTimeout { .. } => "timeout",
        }
    }

    pub fn side(&self) -> Side {
        match *self {
            TerminalState::ClosedClean { side }
            | TerminalState::ClosedError { side, .. }
            | TerminalState::ClosedTimeout { side } => side,
        }
    }

    pub fn comment(&self) -> Option<EventComment> {
        match self {
            TerminalState::ClosedClean { .. } => None,
            TerminalState::ClosedError { class, .. } => Some(class.comment()),
            TerminalState::ClosedTimeout { .. } => Some(EventComment::OperationTimeout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub state: TerminalState,
    pub bytes_client_to_upstream: u64,
    pub bytes_upstream_to_client: u64,
}

/// Result of one read-then-write step in a single direction.
enum Step {
    Forwarded(usize),
    Done(TerminalState),
}

#[derive(Debug, Clone)]
pub struct DuplexForwarder {
    buffer_size: usize,
    read_timeout: Duration,
}

impl DuplexForwarder {
    pub fn new(buffer_size: usize, read_timeout: Duration) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            read_timeout,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Relay until one side ends the session, then close both transports.
    ///
    /// Counters on `ctx` only ever include bytes fully written to the
    /// opposite side.
    pub async fn relay<C, U>(&self, ctx: &mut ConnectionContext, client: C, upstream: U) -> RelayOutcome
    where
        C: AsyncRead + AsyncWrite,
        U: AsyncRead + AsyncWrite,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let mut client_buffer = buffers::chunk(self.buffer_size);
        let mut upstream_buffer = buffers::chunk(self.buffer_size);

        let state = loop {
            // Both reads race; neither side is favoured.
            let step = tokio::select! {
                read = timeout(self.read_timeout, client_read.read(&mut client_buffer[..])) => {
                    self.forward(read, &client_buffer, &mut upstream_write, Side::Client, Side::Upstream).await
                }
                read = timeout(self.read_timeout, upstream_read.read(&mut upstream_buffer[..])) => {
                    self.forward(read, &upstream_buffer, &mut client_write, Side::Upstream, Side::Client).await
                }
            };

            match step {
                (Side::Client, Step::Forwarded(n)) => {
                    ctx.bytes_client_to_upstream += n as u64;
                    counter!("gateway.bytes", n as u64, "direction" => "client_to_upstream");
                    trace!(conn_id = ctx.id, bytes = n, "client -> upstream");
                }
                (Side::Upstream, Step::Forwarded(n)) => {
                    ctx.bytes_upstream_to_client += n as u64;
                    counter!("gateway.bytes", n as u64, "direction" => "upstream_to_client");
                    trace!(conn_id = ctx.id, bytes = n, "upstream -> client");
                }
                (_, Step::Done(state)) => break state,
            }
        };

        let _ = timeout(SHUTDOWN_GRACE, client_write.shutdown()).await;
        let _ = timeout(SHUTDOWN_GRACE, upstream_write.shutdown()).await;

        debug!(conn_id = ctx.id, state = state.label(), side = %state.side(), "Relay finished");
        ctx.emit(EventCode::ClientToUpstream, ctx.bytes_client_to_upstream, None);
        ctx.emit(EventCode::UpstreamToClient, ctx.bytes_upstream_to_client, None);
        ctx.emit(
            EventCode::Close,
            ctx.bytes_client_to_upstream + ctx.bytes_upstream_to_client,
            state.comment(),
        );
        counter!("gateway.connections.closed", 1, "state" => state.label());
        histogram!("gateway.connection.duration", ctx.elapsed_secs());

        RelayOutcome {
            state,
            bytes_client_to_upstream: ctx.bytes_client_to_upstream,
            bytes_upstream_to_client: ctx.bytes_upstream_to_client,
        }
    }

    /// Write what `from` produced to the opposite side.
    async fn forward<W>(
        &self,
        read: Result<io::Result<usize>, tokio::time::error::Elapsed>,
        buffer: &[u8],
        writer: &mut W,
        from: Side,
        to: Side,
    ) -> (Side, Step)
    where
        W: AsyncWrite + Unpin,
    {
        let n = match read {
            Ok(Ok(0)) => return (from, Step::Done(TerminalState::ClosedClean { side: from })),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(side = %from, error = %e, "Relay read failed");
                let class = ErrorClass::from_io(&e);
                return (from, Step::Done(TerminalState::ClosedError { side: from, class }));
            }
            Err(_) => {
                counter!("gateway.relay.timeout", 1);
                return (from, Step::Done(TerminalState::ClosedTimeout { side: from }));
            }
        };

        match timeout(self.read_timeout, writer.write_all(&buffer[..n])).await {
            Ok(Ok(())) => (from, Step::Forwarded(n)),
            Ok(Err(e)) => {
                debug!(side = %to, error = %e, "Relay write failed");
                let class = ErrorClass::from_io(&e);
                (from, Step::Done(TerminalState::ClosedError { side: to, class }))
            }
            Err(_) => (from, Step::Done(TerminalState::ClosedTimeout { side: to })),
        }
    }
}
