//! Backend contract: how transports hand framed links to a node.
//!
//! A backend produces [`MessageConn`]s: bidirectional links that move whole
//! frames. Concrete transports live outside this crate; the stream adapter
//! here frames any `AsyncRead + AsyncWrite` with a 4-byte big-endian length
//! prefix, and [`ExternalBackend`] lets callers inject links directly.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use meshnet_core::wire::MAX_FRAME_LEN;

use crate::task::ShutdownSignal;

/// Buffer size of each direction of an in-memory pipe.
const PIPE_BUFFER: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend is already running")]
    AlreadyRunning,

    #[error("backend is no longer accepting connections")]
    Closed,

    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),
}

// ── Framed links ──────────────────────────────────────────────────────────────

/// Sending half of a framed link.
pub trait FrameSink: Send {
    /// Send one complete frame.
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>>;

    /// Flush and close the link. The peer observes a clean close.
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// Receiving half of a framed link.
pub trait FrameSource: Send {
    /// Receive one complete frame. `Ok(None)` means the peer closed the link
    /// cleanly; `Err` means the transport failed.
    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>>;
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>> {
        (**self).send(frame)
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        (**self).close()
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        (**self).recv()
    }
}

/// A bidirectional, message-framed link to one adjacent peer.
pub struct MessageConn {
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
}

impl MessageConn {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }

    /// Frame a byte stream (TCP socket, Unix socket, pipe).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(
            StreamSink {
                writer: FramedWrite::new(writer, frame_codec()),
            },
            StreamSource {
                reader: FramedRead::new(reader, frame_codec()),
            },
        )
    }

    /// Two in-memory links connected back to back.
    pub fn pipe() -> (MessageConn, MessageConn) {
        let (a, b) = tokio::io::duplex(PIPE_BUFFER);
        (Self::from_stream(a), Self::from_stream(b))
    }

    pub fn into_parts(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.sink, self.source)
    }
}

/// 4-byte big-endian length prefix, frames capped at `MAX_FRAME_LEN`.
fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

struct StreamSink<S> {
    writer: FramedWrite<WriteHalf<S>, LengthDelimitedCodec>,
}

impl<S> FrameSink for StreamSink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(self.writer.send(frame))
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(SinkExt::<Bytes>::close(&mut self.writer))
    }
}

struct StreamSource<S> {
    reader: FramedRead<ReadHalf<S>, LengthDelimitedCodec>,
}

impl<S> FrameSource for StreamSource<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move {
            let frame = self.reader.next().await.transpose()?;
            Ok(frame.map(BytesMut::freeze))
        })
    }
}

// ── Backends ──────────────────────────────────────────────────────────────────

/// A source of new links.
///
/// `run` pushes every link it establishes into `conns` and returns once
/// `shutdown` is raised or `conns` is closed. It runs inside the node's task
/// group, so `Node::backend_wait` waits for it.
pub trait Backend: Send + 'static {
    fn run(
        self: Box<Self>,
        conns: mpsc::Sender<MessageConn>,
        shutdown: ShutdownSignal,
    ) -> BoxFuture<'static, Result<(), BackendError>>;
}

/// A backend whose links are supplied by the caller.
///
/// Clone it before handing it to `Node::add_backend`, then feed links
/// through the kept handle.
#[derive(Clone)]
pub struct ExternalBackend {
    tx: mpsc::UnboundedSender<MessageConn>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<MessageConn>>>>,
}

impl Default for ExternalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalBackend {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// Hand an established link to the node this backend is attached to.
    pub fn new_connection(&self, conn: MessageConn) -> Result<(), BackendError> {
        self.tx.send(conn).map_err(|_| BackendError::Closed)
    }
}

impl Backend for ExternalBackend {
    fn run(
        self: Box<Self>,
        conns: mpsc::Sender<MessageConn>,
        mut shutdown: ShutdownSignal,
    ) -> BoxFuture<'static, Result<(), BackendError>> {
        Box::pin(async move {
            let mut rx = self
                .rx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .ok_or(BackendError::AlreadyRunning)?;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),

                    conn = rx.recv() => {
                        let Some(conn) = conn else { return Ok(()) };
                        if conns.send(conn).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        })
    }
}
