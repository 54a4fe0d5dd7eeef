//! meshnet: a mesh overlay routing and forwarding engine.
//!
//! Nodes connect pairwise over any message-framed transport, flood their
//! adjacency to each other, compute shortest paths and relay datagrams
//! addressed to `node:service` across the mesh.

pub mod backend;
pub mod connection;
mod flood;
pub mod forward;
pub mod names;
pub mod node;
pub mod packet;
pub mod routing;
pub mod stats;
pub mod task;

pub use backend::{Backend, BackendError, ExternalBackend, FrameSink, FrameSource, MessageConn};
pub use connection::{ConnState, ConnectionInfo};
pub use forward::ForwardError;
pub use names::{NameError, NameRegistry};
pub use node::{Node, NodeError, NodeStatus};
pub use packet::{Addr, PacketConn, PacketError};
pub use routing::{RoutingFeed, RoutingSnapshot};
pub use stats::StatsSnapshot;
pub use task::ShutdownSignal;

pub use meshnet_core::{MeshConfig, NodeSettings};
