//! Adjacency flooding: how records enter the store and how they reach the
//! rest of the mesh.

use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use meshnet_core::wire::{encode_control, ControlMessage, RoutingUpdate};

use crate::connection::{Connection, SendError};
use crate::node::NodeInner;
use crate::routing::{Accepted, RoutingState};

/// Floor on the periodic broadcast interval.
const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

impl NodeInner {
    pub(crate) fn routing_state(&self) -> MutexGuard<'_, RoutingState> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Our live adjacency, read from the connection map.
    fn local_adjacency(&self) -> BTreeMap<String, f64> {
        self.connections
            .iter()
            .filter(|c| c.is_open())
            .map(|c| (c.peer.clone(), c.cost))
            .collect()
    }

    /// A fresh own record with the next sequence number.
    pub(crate) fn own_update(&self) -> RoutingUpdate {
        let mut routing = self.routing_state();
        let sequence = routing.next_sequence();
        RoutingUpdate {
            origin: self.id.clone(),
            epoch: routing.epoch,
            sequence,
            connections: self.local_adjacency(),
        }
    }

    /// A link finished its handshake and is in the connection map.
    pub(crate) fn on_connected(&self, connection: &Arc<Connection>, update: RoutingUpdate) {
        let known: Vec<RoutingUpdate> = self.routing_state().records().cloned().collect();
        for record in known {
            if record.origin == connection.peer {
                continue;
            }
            self.send_control(connection, &ControlMessage::Route(record));
        }

        self.on_route_update(update, Some(&connection.peer));
        self.recompute();
        self.broadcast_own();
    }

    /// A link's read loop exited.
    pub(crate) fn on_disconnected(&self, connection: &Arc<Connection>) {
        self.connections
            .remove_if(&connection.peer, |_, installed| installed.id == connection.id);
        if self.shutdown_signal().is_raised() {
            return;
        }
        self.recompute();
        self.broadcast_own();
    }

    /// Merge a record heard from `from` (or produced locally when `None`)
    /// and pass it on if it was new.
    pub(crate) fn on_route_update(&self, update: RoutingUpdate, from: Option<&str>) {
        if update.origin == self.id {
            return;
        }
        let named = std::iter::once(&update.origin).chain(update.connections.keys());
        for name in named {
            if let Err(e) = self.names.add(name) {
                self.stats.record_malformed();
                tracing::warn!(origin = %update.origin, error = %e, "routing update dropped");
                return;
            }
        }

        {
            let mut routing = self.routing_state();
            match routing.accept(update.clone(), Instant::now()) {
                Accepted::Stale => return,
                Accepted::Newer { changed } => {
                    tracing::trace!(
                        origin = %update.origin,
                        sequence = update.sequence,
                        changed,
                        "routing update accepted"
                    );
                    if changed {
                        self.recompute_locked(&mut routing);
                    }
                }
            }
        }

        self.flood(&ControlMessage::Route(update), from);
    }

    pub(crate) fn recompute(&self) {
        let mut routing = self.routing_state();
        self.recompute_locked(&mut routing);
    }

    /// Rebuild the table and publish it if it changed. Neighbors are read
    /// under the routing lock so every published next hop is a live link.
    fn recompute_locked(&self, routing: &mut RoutingState) {
        let neighbors = self.local_adjacency();
        let table = routing.compute(&self.id, &neighbors);
        if routing.set_table(table) {
            let snapshot = routing.table();
            tracing::debug!(
                destinations = snapshot.len().saturating_sub(1),
                "routing table updated"
            );
            self.routes.send_replace(snapshot);
        }
    }

    pub(crate) fn broadcast_own(&self) {
        let update = self.own_update();
        self.flood(&ControlMessage::Route(update), None);
    }

    /// Send a control message to every open neighbor except `except`.
    fn flood(&self, message: &ControlMessage, except: Option<&str>) {
        let frame = match encode_control(self.hash, message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode control message");
                return;
            }
        };
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| Some(c.peer.as_str()) != except)
            .map(|c| c.value().clone())
            .collect();
        for connection in targets {
            self.queue_control(&connection, frame.clone());
        }
    }

    fn send_control(&self, connection: &Connection, message: &ControlMessage) {
        match encode_control(self.hash, message) {
            Ok(frame) => self.queue_control(connection, frame),
            Err(e) => tracing::warn!(error = %e, "failed to encode control message"),
        }
    }

    fn queue_control(&self, connection: &Connection, frame: bytes::Bytes) {
        match connection.send(frame) {
            Ok(()) | Err(SendError::Closed) => {}
            Err(SendError::QueueFull) => {
                self.stats.record_queue_full();
                tracing::debug!(peer = %connection.peer, "control frame dropped, queue full");
            }
        }
    }

    /// Age out records; recompute when any were removed.
    pub(crate) fn expire_records(&self) {
        let mut routing = self.routing_state();
        if routing.expire(self.settings.node_expiry(), Instant::now()) {
            self.recompute_locked(&mut routing);
        }
    }
}

/// Periodic refresh: expire stale records and re-announce our adjacency.
pub(crate) async fn flood_loop(node: Arc<NodeInner>) {
    let mut shutdown = node.shutdown_signal();
    let period = node.settings.route_update_interval().max(MIN_UPDATE_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }
        node.expire_records();
        node.broadcast_own();
    }
    tracing::debug!(node = %node.id, "flood loop stopped");
}
