//! Connections: one live link to a directly adjacent peer.
//!
//! Lifecycle of a link handed over by a backend:
//!   1. Both sides send Hello (identity + adjacency record).
//!   2. The peer's Hello is validated; self-links are answered with Reject
//!      and closed.
//!   3. If an open link to the same peer exists, the node with the smaller
//!      id rejects the new one. The other node holds it on standby until
//!      either that Reject arrives or its own installed link closes, so both
//!      sides settle on the same link.
//!   4. The Connection is installed, a writer task drains its outbound
//!      queue, and the read loop feeds frames to routing and forwarding.
//!   5. When the read loop exits the Connection is removed and routes are
//!      recomputed without it.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use meshnet_core::wire::{encode_control, ControlMessage, Frame, RoutingUpdate, WireError};

use crate::backend::{FrameSink, FrameSource, MessageConn};
use crate::names::NameError;
use crate::node::NodeInner;
use crate::task::ShutdownSignal;

/// Bound on flushing and closing a sink whose transport may be stuck.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("transport error during handshake: {0}")]
    Io(#[from] io::Error),

    #[error("malformed handshake frame: {0}")]
    Wire(#[from] WireError),

    #[error("peer did not send hello in time")]
    Timeout,

    #[error("link closed during handshake")]
    Closed,

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("peer rejected the link: {0}")]
    Rejected(String),

    #[error("expected hello, got {0}")]
    Unexpected(&'static str),

    #[error("peer claims our own node id")]
    SelfConnection,

    #[error("already connected to {0}")]
    Duplicate(String),

    #[error(transparent)]
    Name(#[from] NameError),
}

impl HandshakeError {
    /// Reason sent to the peer in a Reject frame, if this side refuses the link.
    fn reject_reason(&self) -> Option<String> {
        match self {
            HandshakeError::SelfConnection
            | HandshakeError::Duplicate(_)
            | HandshakeError::Name(_) => Some(self.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub peer: String,
    pub cost: f64,
    pub state: ConnState,
    /// Time since the last frame of any kind arrived.
    #[serde(serialize_with = "as_millis")]
    pub idle: Duration,
    #[serde(serialize_with = "as_millis")]
    pub uptime: Duration,
    pub data_frames_received: u64,
    pub control_frames_received: u64,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// An installed link. Owned by the node's connection map.
pub(crate) struct Connection {
    /// Distinguishes successive links to the same peer.
    pub(crate) id: u64,
    pub(crate) peer: String,
    pub(crate) cost: f64,
    established_at: Instant,
    /// Microseconds after `established_at` of the most recent inbound frame.
    last_received_us: AtomicU64,
    data_frames: AtomicU64,
    control_frames: AtomicU64,
    state: watch::Sender<ConnState>,
    outbound: mpsc::Sender<Bytes>,
}

impl Connection {
    fn new(id: u64, peer: String, cost: f64, outbound: mpsc::Sender<Bytes>) -> Self {
        let (state, _) = watch::channel(ConnState::Open);
        Self {
            id,
            peer,
            cost,
            established_at: Instant::now(),
            last_received_us: AtomicU64::new(0),
            data_frames: AtomicU64::new(0),
            control_frames: AtomicU64::new(0),
            state,
            outbound,
        }
    }

    /// Queue a frame without waiting. A full queue drops the frame.
    pub(crate) fn send(&self, frame: Bytes) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.state.borrow() == ConnState::Open
    }

    /// Ask both loops to wind down.
    pub(crate) fn close(&self) {
        self.state.send_if_modified(|s| {
            if *s == ConnState::Open {
                *s = ConnState::Closing;
                true
            } else {
                false
            }
        });
    }

    fn touch(&self) {
        let us = self.established_at.elapsed().as_micros() as u64;
        self.last_received_us.store(us, Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    pub(crate) fn idle(&self) -> Duration {
        let last = Duration::from_micros(self.last_received_us.load(Ordering::Relaxed));
        self.established_at.elapsed().saturating_sub(last)
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer: self.peer.clone(),
            cost: self.cost,
            state: *self.state.borrow(),
            idle: self.idle(),
            uptime: self.established_at.elapsed(),
            data_frames_received: self.data_frames.load(Ordering::Relaxed),
            control_frames_received: self.control_frames.load(Ordering::Relaxed),
        }
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// Drive one link from handshake to teardown.
pub(crate) async fn serve(
    node: Arc<NodeInner>,
    conn: MessageConn,
    cost: f64,
    node_cost: Arc<HashMap<String, f64>>,
) {
    let (mut sink, mut source) = conn.into_parts();
    let mut shutdown = node.shutdown_signal();

    let (peer, update) = match handshake(&node, sink.as_mut(), source.as_mut(), &mut shutdown).await
    {
        Ok(hello) => hello,
        Err(e) => {
            refuse(&node, sink.as_mut(), e).await;
            return;
        }
    };

    let cost = node_cost.get(&peer).copied().unwrap_or(cost);
    let (out_tx, out_rx) = mpsc::channel(node.settings.connection_queue_depth.max(1));
    let connection = Arc::new(Connection::new(node.next_connection_id(), peer.clone(), cost, out_tx));

    let mut pending = Vec::new();
    loop {
        let existing = match try_install(&node, &connection) {
            Install::Done => break,
            Install::Busy(existing) => existing,
        };
        let verdict = if node.id < peer {
            Err(HandshakeError::Duplicate(peer.clone()))
        } else {
            standby(&node, &existing, source.as_mut(), &mut pending, &mut shutdown).await
        };
        if let Err(e) = verdict {
            refuse(&node, sink.as_mut(), e).await;
            return;
        }
    }
    connection.touch();
    tracing::info!(peer = %peer, cost, "connection established");

    node.tasks.spawn(write_loop(connection.clone(), sink, out_rx, node.shutdown_signal()));
    node.on_connected(&connection, update);

    let mut flow = Flow::Continue;
    for raw in pending {
        flow = handle_frame(&node, &connection, raw);
        if let Flow::Close = flow {
            break;
        }
    }
    if let Flow::Continue = flow {
        read_loop(&node, &connection, source.as_mut(), &mut shutdown).await;
    }

    connection.close();
    node.on_disconnected(&connection);
    tracing::info!(peer = %peer, "connection closed");
}

/// Exchange Hellos and validate the peer's identity.
async fn handshake(
    node: &NodeInner,
    sink: &mut dyn FrameSink,
    source: &mut dyn FrameSource,
    shutdown: &mut ShutdownSignal,
) -> Result<(String, RoutingUpdate), HandshakeError> {
    let deadline = tokio::time::Instant::now() + node.settings.handshake_timeout();
    let hello = ControlMessage::Hello {
        node: node.id.clone(),
        update: node.own_update(),
    };
    let hello = encode_control(node.hash, &hello)?;

    tokio::select! {
        _ = shutdown.recv() => return Err(HandshakeError::ShuttingDown),
        r = tokio::time::timeout_at(deadline, sink.send(hello)) => {
            r.map_err(|_| HandshakeError::Timeout)??
        }
    }
    let received = tokio::select! {
        _ = shutdown.recv() => return Err(HandshakeError::ShuttingDown),
        r = tokio::time::timeout_at(deadline, source.recv()) => {
            r.map_err(|_| HandshakeError::Timeout)??
        }
    };
    let raw = received.ok_or(HandshakeError::Closed)?;

    let (peer, update) = match Frame::decode(raw)? {
        Frame::Control {
            message: ControlMessage::Hello { node, update },
            ..
        } => (node, update),
        Frame::Control {
            message: ControlMessage::Reject { reason },
            ..
        } => return Err(HandshakeError::Rejected(reason)),
        Frame::Control {
            message: ControlMessage::Route(_),
            ..
        } => return Err(HandshakeError::Unexpected("route update")),
        Frame::Data(_) => return Err(HandshakeError::Unexpected("data frame")),
    };

    if peer == node.id {
        return Err(HandshakeError::SelfConnection);
    }
    node.names.add(&peer)?;
    Ok((peer, update))
}

enum Install {
    Done,
    Busy(Arc<Connection>),
}

/// Put `connection` in the map unless an open link to the same peer holds
/// the slot. A link that is already closing is replaced.
fn try_install(node: &NodeInner, connection: &Arc<Connection>) -> Install {
    match node.connections.entry(connection.peer.clone()) {
        Entry::Occupied(mut slot) => {
            if slot.get().is_open() {
                return Install::Busy(slot.get().clone());
            }
            slot.insert(connection.clone());
            Install::Done
        }
        Entry::Vacant(slot) => {
            slot.insert(connection.clone());
            Install::Done
        }
    }
}

/// Hold a second link to a connected peer until the installed link closes
/// (`Ok`) or the peer rejects this one. Frames arriving meanwhile are kept in
/// `pending` for replay once installed.
async fn standby(
    node: &NodeInner,
    existing: &Connection,
    source: &mut dyn FrameSource,
    pending: &mut Vec<Bytes>,
    shutdown: &mut ShutdownSignal,
) -> Result<(), HandshakeError> {
    let mut state = existing.state.subscribe();
    let deadline = tokio::time::Instant::now() + node.settings.handshake_timeout();
    loop {
        let received = tokio::select! {
            _ = shutdown.recv() => return Err(HandshakeError::ShuttingDown),
            _ = closing(&mut state) => return Ok(()),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(HandshakeError::Duplicate(existing.peer.clone()));
            }
            r = source.recv() => r?,
        };
        let raw = received.ok_or(HandshakeError::Closed)?;
        if let Ok(Frame::Control {
            message: ControlMessage::Reject { reason },
            ..
        }) = Frame::decode(raw.clone())
        {
            return Err(HandshakeError::Rejected(reason));
        }
        if pending.len() < node.settings.connection_queue_depth.max(1) {
            pending.push(raw);
        } else {
            node.stats.record_queue_full();
        }
    }
}

/// Log a failed handshake, tell the peer why if we are the one refusing, and
/// close the link.
async fn refuse(node: &NodeInner, sink: &mut dyn FrameSink, err: HandshakeError) {
    match &err {
        HandshakeError::ShuttingDown => tracing::debug!("handshake abandoned, shutting down"),
        _ => tracing::warn!(error = %err, "handshake failed, closing link"),
    }
    if let Some(reason) = err.reject_reason() {
        if let Ok(frame) = encode_control(node.hash, &ControlMessage::Reject { reason }) {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(frame)).await;
        }
    }
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
}

/// Resolves once the connection leaves the Open state.
async fn closing(state: &mut watch::Receiver<ConnState>) {
    let _ = state.wait_for(|s| *s != ConnState::Open).await;
}

enum Flow {
    Continue,
    Close,
}

async fn read_loop(
    node: &NodeInner,
    connection: &Connection,
    source: &mut dyn FrameSource,
    shutdown: &mut ShutdownSignal,
) {
    let mut state = connection.state.subscribe();
    loop {
        let received = tokio::select! {
            _ = shutdown.recv() => return,
            _ = closing(&mut state) => return,
            r = source.recv() => r,
        };
        match received {
            Ok(Some(raw)) => {
                if let Flow::Close = handle_frame(node, connection, raw) {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!(peer = %connection.peer, "peer closed the link");
                return;
            }
            Err(e) => {
                tracing::warn!(peer = %connection.peer, error = %e, "transport failure");
                return;
            }
        }
    }
}

fn handle_frame(node: &NodeInner, connection: &Connection, raw: Bytes) -> Flow {
    connection.touch();
    match Frame::decode(raw) {
        Ok(Frame::Data(frame)) => {
            connection.data_frames.fetch_add(1, Ordering::Relaxed);
            node.handle_data(frame);
            Flow::Continue
        }
        Ok(Frame::Control { from_node, message }) => {
            connection.control_frames.fetch_add(1, Ordering::Relaxed);
            if node.names.lookup(from_node).as_deref() != Some(connection.peer.as_str()) {
                node.stats.record_malformed();
                tracing::warn!(
                    peer = %connection.peer,
                    from_node = hex::encode(from_node.to_be_bytes()),
                    "control frame sender does not match link peer, dropping"
                );
                return Flow::Continue;
            }
            match message {
                ControlMessage::Route(update) => {
                    node.on_route_update(update, Some(&connection.peer));
                    Flow::Continue
                }
                ControlMessage::Hello { .. } => {
                    tracing::debug!(peer = %connection.peer, "repeated hello ignored");
                    Flow::Continue
                }
                ControlMessage::Reject { reason } => {
                    tracing::warn!(peer = %connection.peer, reason, "peer rejected the link");
                    Flow::Close
                }
            }
        }
        Err(e) if e.is_desync() => {
            node.stats.record_malformed();
            tracing::warn!(peer = %connection.peer, error = %e, "framing lost, closing link");
            Flow::Close
        }
        Err(e) => {
            node.stats.record_malformed();
            tracing::warn!(peer = %connection.peer, error = %e, "malformed frame dropped");
            Flow::Continue
        }
    }
}

/// Drain the outbound queue into the transport. Exits on shutdown, on
/// connection close, or on the first send failure.
async fn write_loop(
    connection: Arc<Connection>,
    mut sink: Box<dyn FrameSink>,
    mut outbound: mpsc::Receiver<Bytes>,
    mut shutdown: ShutdownSignal,
) {
    let mut state = connection.state.subscribe();
    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => break,
            _ = closing(&mut state) => break,
            f = outbound.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };
        let sent = tokio::select! {
            _ = shutdown.recv() => break,
            _ = closing(&mut state) => break,
            r = sink.send(frame) => r,
        };
        if let Err(e) = sent {
            tracing::warn!(peer = %connection.peer, error = %e, "send failed");
            break;
        }
    }

    connection.close();
    if let Err(e) = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.unwrap_or(Ok(())) {
        tracing::debug!(peer = %connection.peer, error = %e, "close failed");
    }
    connection.state.send_replace(ConnState::Closed);
}
