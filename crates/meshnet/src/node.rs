//! Node: one mesh identity and everything it owns.
//!
//! `Node` is a cheap handle over `NodeInner`. Creating one starts the
//! periodic flooding task (and the echo service, if enabled); attaching a
//! backend starts accepting links from it. `shutdown` stops everything and
//! `backend_wait` returns once every task has exited.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use meshnet_core::NodeSettings;

use crate::backend::{Backend, MessageConn};
use crate::connection::{self, Connection, ConnectionInfo};
use crate::flood::flood_loop;
use crate::names::{NameError, NameRegistry};
use crate::packet::{self, Addr, Listener, PacketConn, PacketError};
use crate::routing::{RoutingFeed, RoutingSnapshot, RoutingState};
use crate::stats::{NodeStats, StatsSnapshot};
use crate::task::{ShutdownSignal, TaskGroup};

/// Links handed over by a backend but not yet picked up by the acceptor.
const ACCEPT_QUEUE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node id must not be empty")]
    EmptyId,

    #[error("a node must be created inside a Tokio runtime")]
    NoRuntime,

    #[error("node is shut down")]
    ShutDown,

    #[error("link cost must be finite and positive, got {0}")]
    InvalidCost(f64),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Serializable overview of a node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub connections: Vec<ConnectionInfo>,
    pub routing_table: BTreeMap<String, String>,
    /// Adjacency claimed by every known origin.
    pub known_nodes: BTreeMap<String, BTreeMap<String, f64>>,
    pub stats: StatsSnapshot,
    /// Background tasks still running.
    pub tasks: usize,
}

pub(crate) struct NodeInner {
    pub(crate) id: String,
    pub(crate) hash: u64,
    pub(crate) settings: NodeSettings,
    pub(crate) names: NameRegistry,
    pub(crate) connections: DashMap<String, Arc<Connection>>,
    pub(crate) listeners: DashMap<String, Listener>,
    pub(crate) routing: Mutex<RoutingState>,
    /// Published routing table. Only written under the routing lock.
    pub(crate) routes: watch::Sender<RoutingSnapshot>,
    pub(crate) stats: NodeStats,
    pub(crate) tasks: TaskGroup,
    shutdown: watch::Sender<bool>,
    connection_ids: AtomicU64,
}

impl NodeInner {
    pub(crate) fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.shutdown.subscribe())
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::Relaxed)
    }
}

/// Handle to a running mesh node. Clones share the node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(id: impl Into<String>, settings: NodeSettings) -> Result<Node, NodeError> {
        let id = id.into();
        if id.is_empty() {
            return Err(NodeError::EmptyId);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(NodeError::NoRuntime);
        }

        let names = NameRegistry::new();
        let hash = names.add(&id)?;
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let routing = RoutingState::new(&id, epoch);
        let (routes, _) = watch::channel(routing.table());
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            id,
            hash,
            settings,
            names,
            connections: DashMap::new(),
            listeners: DashMap::new(),
            routing: Mutex::new(routing),
            routes,
            stats: NodeStats::default(),
            tasks: TaskGroup::default(),
            shutdown,
            connection_ids: AtomicU64::new(1),
        });

        inner.tasks.spawn(flood_loop(inner.clone()));
        if inner.settings.ping_service {
            let echo = packet::bind(&inner, "ping")?;
            inner.tasks.spawn(packet::ping_service(echo));
        }
        tracing::info!(node = %inner.id, epoch, "node started");

        Ok(Node { inner })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.id
    }

    /// Start a backend and accept every link it produces. `cost` applies to
    /// all its links unless `node_cost` overrides it for a specific peer.
    pub fn add_backend<B: Backend>(
        &self,
        backend: B,
        cost: f64,
        node_cost: Option<HashMap<String, f64>>,
    ) -> Result<(), NodeError> {
        let node_cost = node_cost.unwrap_or_default();
        if let Some(bad) = std::iter::once(cost)
            .chain(node_cost.values().copied())
            .find(|c| !c.is_finite() || *c <= 0.0)
        {
            return Err(NodeError::InvalidCost(bad));
        }
        if self.inner.shutdown_signal().is_raised() {
            return Err(NodeError::ShutDown);
        }

        let (conns_tx, conns_rx) = mpsc::channel(ACCEPT_QUEUE);
        let shutdown = self.inner.shutdown_signal();
        self.inner.tasks.spawn(async move {
            if let Err(e) = Box::new(backend).run(conns_tx, shutdown).await {
                tracing::error!(error = %e, "backend failed");
            }
        });
        self.inner.tasks.spawn(accept_loop(
            self.inner.clone(),
            conns_rx,
            cost,
            Arc::new(node_cost),
        ));
        Ok(())
    }

    /// Bind a datagram endpoint. An empty `service` picks a random name.
    pub fn listen_packet(&self, service: &str) -> Result<PacketConn, PacketError> {
        if self.inner.shutdown_signal().is_raised() {
            return Err(PacketError::Closed);
        }
        packet::bind(&self.inner, service)
    }

    pub fn new_addr(&self, node: impl Into<String>, service: impl Into<String>) -> Addr {
        Addr::new(node, service)
    }

    pub fn subscribe_routing_updates(&self) -> RoutingFeed {
        RoutingFeed::new(self.inner.routes.subscribe(), self.inner.shutdown_signal())
    }

    pub fn routing_table(&self) -> RoutingSnapshot {
        self.inner.routes.borrow().clone()
    }

    pub fn connection_info(&self, peer: &str) -> Option<ConnectionInfo> {
        self.inner.connections.get(peer).map(|c| c.info())
    }

    pub fn status(&self) -> NodeStatus {
        let mut connections: Vec<ConnectionInfo> =
            self.inner.connections.iter().map(|c| c.info()).collect();
        connections.sort_by(|a, b| a.peer.cmp(&b.peer));

        let known_nodes = self
            .inner
            .routing_state()
            .records()
            .map(|r| (r.origin.clone(), r.connections.clone()))
            .collect();

        NodeStatus {
            id: self.inner.id.clone(),
            connections,
            routing_table: (*self.routing_table()).clone(),
            known_nodes,
            stats: self.inner.stats.snapshot(),
            tasks: self.inner.tasks.len(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Signal every task of this node to stop. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            tracing::info!(node = %self.inner.id, "node shutting down");
        }
    }

    /// Wait until every backend, connection and background task has exited.
    pub async fn backend_wait(&self) {
        self.inner.tasks.wait().await;
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<NodeInner> {
        &self.inner
    }

    /// Publish a fabricated route. Overwritten by the next recompute.
    #[cfg(test)]
    pub(crate) fn inject_route(&self, destination: &str, next_hop: &str) {
        let _ = self.inner.names.add(destination);
        let mut routing = self.inner.routing_state();
        let mut table = (*routing.table()).clone();
        table.insert(destination.to_string(), next_hop.to_string());
        if routing.set_table(table) {
            self.inner.routes.send_replace(routing.table());
        }
    }
}

/// Hand every link a backend produces to its own connection task.
async fn accept_loop(
    node: Arc<NodeInner>,
    mut conns: mpsc::Receiver<MessageConn>,
    cost: f64,
    node_cost: Arc<HashMap<String, f64>>,
) {
    let mut shutdown = node.shutdown_signal();
    loop {
        let conn = tokio::select! {
            _ = shutdown.recv() => break,
            c = conns.recv() => match c {
                Some(c) => c,
                None => break,
            },
        };
        node.tasks.spawn(connection::serve(
            node.clone(),
            conn,
            cost,
            node_cost.clone(),
        ));
    }
}
