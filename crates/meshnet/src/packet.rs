//! Packet multiplexing: many named services share one node identity.
//!
//! A [`PacketConn`] is a datagram endpoint bound to one service name on the
//! local node. Writes address a remote `node:service`; reads return the
//! sender's address. Delivery is best effort: unreachable destinations and
//! full queues drop packets without reporting an error to the writer.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, watch};

use meshnet_core::wire::{DataFrame, WireError, MAX_PAYLOAD, MAX_SERVICE_NAME};

use crate::forward::ForwardError;
use crate::names::NameError;
use crate::node::NodeInner;

/// Length of generated service names.
const EPHEMERAL_SERVICE_LEN: usize = 8;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A mesh address: a service on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr {
    node: String,
    service: String,
}

impl Addr {
    pub fn new(node: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            service: service.into(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.service)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("read deadline exceeded")]
    Timeout,

    #[error("packet connection is closed")]
    Closed,

    #[error("service {0:?} is already bound on this node")]
    ServiceInUse(String),

    #[error("service name of {0} bytes exceeds {MAX_SERVICE_NAME}")]
    ServiceNameTooLong(usize),

    #[error("payload of {0} bytes exceeds {MAX_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// One received datagram.
#[derive(Debug)]
pub(crate) struct Datagram {
    pub(crate) from: Addr,
    pub(crate) payload: Bytes,
}

/// Registry entry for a bound service.
pub(crate) struct Listener {
    id: u64,
    pub(crate) tx: mpsc::Sender<Datagram>,
}

/// Datagram endpoint bound to one service on the local node.
pub struct PacketConn {
    node: Arc<NodeInner>,
    id: u64,
    service: String,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    deadline: watch::Sender<Option<Instant>>,
    closed: AtomicBool,
}

/// Bind `service` on `node`. An empty name picks a random unused one.
pub(crate) fn bind(node: &Arc<NodeInner>, service: &str) -> Result<PacketConn, PacketError> {
    if service.len() > MAX_SERVICE_NAME {
        return Err(PacketError::ServiceNameTooLong(service.len()));
    }
    let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(node.settings.listener_queue_depth.max(1));

    let service = if service.is_empty() {
        loop {
            let candidate = ephemeral_service();
            if let Entry::Vacant(slot) = node.listeners.entry(candidate.clone()) {
                slot.insert(Listener { id, tx });
                break candidate;
            }
        }
    } else {
        match node.listeners.entry(service.to_string()) {
            Entry::Occupied(_) => return Err(PacketError::ServiceInUse(service.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Listener { id, tx });
                service.to_string()
            }
        }
    };
    tracing::debug!(service = %service, "service bound");

    Ok(PacketConn {
        node: node.clone(),
        id,
        service,
        inbound: tokio::sync::Mutex::new(rx),
        deadline: watch::channel(None).0,
        closed: AtomicBool::new(false),
    })
}

fn ephemeral_service() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(EPHEMERAL_SERVICE_LEN)
        .map(char::from)
        .collect()
}

impl PacketConn {
    pub fn local_addr(&self) -> Addr {
        Addr::new(self.node.id.clone(), self.service.clone())
    }

    /// Send `payload` to `to`. Returns the number of bytes accepted, which
    /// is the whole payload even when the mesh later drops it.
    pub fn write_to(&self, payload: &[u8], to: &Addr) -> Result<usize, PacketError> {
        if self.closed.load(Ordering::Acquire) || self.node.shutdown_signal().is_raised() {
            return Err(PacketError::Closed);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        if to.service.len() > MAX_SERVICE_NAME {
            return Err(PacketError::ServiceNameTooLong(to.service.len()));
        }
        let body = Bytes::copy_from_slice(payload);

        if to.node == self.node.id {
            self.node.deliver_local(self.local_addr(), &to.service, body);
            return Ok(payload.len());
        }

        let frame = DataFrame {
            from_node: self.node.hash,
            from_service: self.service.clone(),
            to_node: self.node.names.resolve(&to.node)?,
            to_service: to.service.clone(),
            hops_to_live: self.node.settings.max_forwarding_hops,
            payload: body,
        };
        match self.node.originate(&to.node, frame) {
            Ok(()) => Ok(payload.len()),
            Err(ForwardError::Wire(e)) => Err(e.into()),
            Err(_) => Ok(payload.len()),
        }
    }

    /// Receive one datagram into `buf`, truncating if it does not fit.
    ///
    /// A deadline set while the read is blocked applies to it.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Addr), PacketError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PacketError::Closed);
        }
        let mut deadline = self.deadline.subscribe();
        let mut shutdown = self.node.shutdown_signal();
        let mut inbound = self.inbound.lock().await;

        let datagram = loop {
            let at = *deadline.borrow_and_update();
            let expired = async move {
                match at {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = shutdown.recv() => return Err(PacketError::Closed),
                d = inbound.recv() => break d.ok_or(PacketError::Closed)?,
                _ = deadline.changed() => continue,
                _ = expired => return Err(PacketError::Timeout),
            }
        };

        let n = buf.len().min(datagram.payload.len());
        buf[..n].copy_from_slice(&datagram.payload[..n]);
        Ok((n, datagram.from))
    }

    /// `None` clears the deadline. Wakes a read already waiting.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadline.send_replace(deadline);
    }

    /// Unbind the service. Pending and future reads fail with `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.node
            .listeners
            .remove_if(&self.service, |_, listener| listener.id == self.id);
        tracing::debug!(service = %self.service, "service unbound");
    }
}

impl Drop for PacketConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Built-in echo: every datagram is sent back to its sender.
pub(crate) async fn ping_service(conn: PacketConn) {
    let mut buf = vec![0u8; MAX_PAYLOAD];
    loop {
        let (n, from) = match conn.read_from(&mut buf).await {
            Ok(received) => received,
            Err(PacketError::Closed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "ping service read failed");
                break;
            }
        };
        if let Err(e) = conn.write_to(&buf[..n], &from) {
            tracing::debug!(to = %from, error = %e, "ping reply failed");
        }
    }
}
