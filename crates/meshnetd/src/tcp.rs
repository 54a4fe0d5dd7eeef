//! TCP backends. Each accepted or dialed socket becomes one framed link.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use meshnet::{Backend, BackendError, MessageConn, ShutdownSignal};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts peers on a bound socket. Accept errors are logged and retried.
pub struct TcpListenerBackend {
    listener: TcpListener,
}

impl TcpListenerBackend {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening for peers");
        Ok(Self { listener })
    }
}

impl Backend for TcpListenerBackend {
    fn run(
        self: Box<Self>,
        conns: mpsc::Sender<MessageConn>,
        shutdown: ShutdownSignal,
    ) -> BoxFuture<'static, Result<(), BackendError>> {
        Box::pin(async move {
            let listener = &self.listener;
            let accept = move || async move {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok::<_, io::Error>((stream, peer.to_string()))
            };
            accept_loop(accept, conns, shutdown).await
        })
    }
}

/// Frame every accepted stream and hand it to the node until shutdown or
/// until the node stops taking links.
async fn accept_loop<F, Fut, S>(
    mut accept: F,
    conns: mpsc::Sender<MessageConn>,
    mut shutdown: ShutdownSignal,
) -> Result<(), BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, String)>>,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            accepted = accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                }
            }
        };
        tracing::debug!(peer = %peer, "inbound tcp connection");
        if conns.send(MessageConn::from_stream(stream)).await.is_err() {
            return Ok(());
        }
    }
}

/// Keeps one outbound link alive, redialing after it drops.
pub struct TcpDialerBackend {
    address: String,
    redial: Duration,
}

impl TcpDialerBackend {
    pub fn new(address: impl Into<String>, redial: Duration) -> Self {
        Self {
            address: address.into(),
            redial,
        }
    }
}

impl Backend for TcpDialerBackend {
    fn run(
        self: Box<Self>,
        conns: mpsc::Sender<MessageConn>,
        mut shutdown: ShutdownSignal,
    ) -> BoxFuture<'static, Result<(), BackendError>> {
        Box::pin(async move {
            loop {
                let dialed = tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    d = TcpStream::connect(&self.address) => d,
                };
                match dialed {
                    Ok(stream) => {
                        tracing::info!(address = %self.address, "dialed peer");
                        let _ = stream.set_nodelay(true);
                        let (conn, closed) = watch_close(MessageConn::from_stream(stream));
                        if conns.send(conn).await.is_err() {
                            return Ok(());
                        }
                        tokio::select! {
                            _ = shutdown.recv() => return Ok(()),
                            _ = closed => {}
                        }
                        tracing::info!(address = %self.address, "link to peer closed");
                    }
                    Err(e) => {
                        tracing::warn!(address = %self.address, error = %e, "dial failed");
                    }
                }
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    _ = tokio::time::sleep(self.redial) => {}
                }
            }
        })
    }
}

/// Wrap a link so the dialer learns when the node is done with it.
fn watch_close(conn: MessageConn) -> (MessageConn, tokio::sync::oneshot::Receiver<()>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let (sink, source) = conn.into_parts();
    let source = ClosingSource {
        inner: source,
        _closed: tx,
    };
    (MessageConn::new(sink, source), rx)
}

/// Fires its oneshot when dropped, which happens once the read loop exits.
struct ClosingSource {
    inner: Box<dyn meshnet::FrameSource>,
    _closed: tokio::sync::oneshot::Sender<()>,
}

impl meshnet::FrameSource for ClosingSource {
    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        self.inner.recv()
    }
}
