//! Forwarding engine: decides, per data frame, between local delivery,
//! relaying to the next hop, and dropping.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;

use meshnet_core::wire::{DataFrame, WireError};

use crate::connection::{Connection, SendError};
use crate::node::NodeInner;
use crate::packet::{Addr, Datagram};

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("maximum number of forwarding hops exceeded")]
    HopLimitExceeded { destination: String },

    #[error("no route to {0}")]
    Unreachable(String),

    #[error("unknown destination node hash {0:016x}")]
    UnknownNode(u64),

    #[error("outbound queue to {0} is full")]
    QueueFull(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl ForwardError {
    pub fn is_hop_limit(&self) -> bool {
        matches!(self, ForwardError::HopLimitExceeded { .. })
    }
}

impl NodeInner {
    /// A data frame arrived from a neighbor.
    pub(crate) fn handle_data(&self, frame: DataFrame) {
        let result = if frame.to_node == self.hash {
            self.deliver_frame(frame);
            Ok(())
        } else {
            match self.names.lookup(frame.to_node) {
                Some(destination) => self.relay(&destination, frame),
                None => Err(ForwardError::UnknownNode(frame.to_node)),
            }
        };
        if let Err(e) = result {
            self.record_drop(&e);
        }
    }

    /// A frame built by a local listener. Drops are counted and logged but
    /// returned so the caller can tell them from encoding failures.
    pub(crate) fn originate(
        &self,
        destination: &str,
        frame: DataFrame,
    ) -> Result<(), ForwardError> {
        if destination == self.id {
            self.deliver_frame(frame);
            return Ok(());
        }
        self.relay(destination, frame).inspect_err(|e| self.record_drop(e))
    }

    fn relay(&self, destination: &str, mut frame: DataFrame) -> Result<(), ForwardError> {
        let next_hop = self.routes.borrow().get(destination).cloned();
        let Some(next_hop) = next_hop else {
            return Err(ForwardError::Unreachable(destination.to_string()));
        };
        if frame.hops_to_live <= 1 {
            return Err(ForwardError::HopLimitExceeded {
                destination: destination.to_string(),
            });
        }
        frame.hops_to_live -= 1;

        let connection: Option<Arc<Connection>> =
            self.connections.get(&next_hop).map(|c| c.value().clone());
        let Some(connection) = connection else {
            return Err(ForwardError::Unreachable(destination.to_string()));
        };

        match connection.send(frame.encode()?) {
            Ok(()) => {
                self.stats.record_forwarded();
                tracing::trace!("forwarding data packet via {next_hop}");
                Ok(())
            }
            Err(SendError::QueueFull) => Err(ForwardError::QueueFull(next_hop)),
            Err(SendError::Closed) => Err(ForwardError::Unreachable(destination.to_string())),
        }
    }

    fn record_drop(&self, err: &ForwardError) {
        match err {
            ForwardError::HopLimitExceeded { destination } => {
                self.stats.record_hop_limit();
                tracing::error!(destination = %destination, "{err}");
            }
            ForwardError::Unreachable(destination) => {
                self.stats.record_unreachable();
                tracing::debug!(destination = %destination, "no route, data packet dropped");
            }
            ForwardError::UnknownNode(hash) => {
                self.stats.record_unknown_node();
                tracing::warn!(
                    to_node = hex::encode(hash.to_be_bytes()),
                    "data packet for unknown node dropped"
                );
            }
            ForwardError::QueueFull(next_hop) => {
                self.stats.record_queue_full();
                tracing::debug!(next_hop = %next_hop, "data packet dropped, queue full");
            }
            ForwardError::Wire(e) => {
                self.stats.record_malformed();
                tracing::warn!(error = %e, "data packet could not be re-encoded");
            }
        }
    }

    fn deliver_frame(&self, frame: DataFrame) {
        let Some(from_node) = self.names.lookup(frame.from_node) else {
            self.stats.record_unknown_node();
            tracing::warn!(
                from_node = hex::encode(frame.from_node.to_be_bytes()),
                "data packet from unknown node dropped"
            );
            return;
        };
        let from = Addr::new(from_node, frame.from_service);
        self.deliver_local(from, &frame.to_service, frame.payload);
    }

    /// Hand a datagram to the local listener for `service`. A missing or
    /// closed listener drops it silently.
    pub(crate) fn deliver_local(&self, from: Addr, service: &str, payload: Bytes) {
        let tx = self.listeners.get(service).map(|l| l.tx.clone());
        let Some(tx) = tx else {
            tracing::trace!(service, "no listener, data packet dropped");
            return;
        };
        match tx.try_send(Datagram { from, payload }) {
            Ok(()) => self.stats.record_delivered(),
            Err(TrySendError::Full(_)) => {
                self.stats.record_queue_full();
                tracing::debug!(service, "listener queue full, data packet dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
