//! meshnet-core: wire format, name hashing, and configuration.
//! The engine and daemon crates both depend on this one.

pub mod config;
pub mod wire;

pub use config::{MeshConfig, NodeSettings};
pub use wire::{name_hash, ControlMessage, DataFrame, Frame, RoutingUpdate, WireError};
