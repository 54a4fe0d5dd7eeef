//! meshnet wire format: the frames exchanged between adjacent nodes.
//!
//! Every frame starts with a one-byte kind tag. Data frames carry a fixed
//! 36-byte header followed by an opaque payload; control frames carry a
//! 12-byte header followed by a JSON control message. Node names never appear
//! in data headers: they are replaced by 8-byte name hashes, and the full
//! names travel in control traffic so every node can resolve them.
//!
//! Header structs are #[repr(C, packed)] byte arrays with zerocopy derives.
//! Multi-byte integers are stored big-endian in byte arrays, so the layout is
//! identical on every host.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame kinds ───────────────────────────────────────────────────────────────

/// Application datagram, relayed hop by hop.
pub const FRAME_DATA: u8 = 0x00;

/// Routing/handshake control message. Never delivered to applications.
pub const FRAME_CONTROL: u8 = 0x01;

// ── Data Header ───────────────────────────────────────────────────────────────

/// Header preceding every data payload.
///
/// Wire size: 36 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DataHeader {
    /// Always FRAME_DATA.
    pub kind: u8,

    /// Remaining forwarding budget. Set to the configured maximum by the
    /// originating node and decremented on every relay.
    pub hops_to_live: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],

    /// Name hash of the originating node.
    pub from_node: [u8; 8],

    /// Name hash of the destination node.
    pub to_node: [u8; 8],

    /// Originating service, zero-padded UTF-8.
    pub from_service: [u8; 8],

    /// Destination service, zero-padded UTF-8.
    pub to_service: [u8; 8],
}

assert_eq_size!(DataHeader, [u8; 36]);

/// Length of [`DataHeader`] on the wire.
pub const DATA_HEADER_LEN: usize = std::mem::size_of::<DataHeader>();

// ── Control Header ────────────────────────────────────────────────────────────

/// Header preceding every JSON control body.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ControlHeader {
    /// Always FRAME_CONTROL.
    pub kind: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 3],

    /// Name hash of the node that sent this frame over the link.
    pub from_node: [u8; 8],
}

assert_eq_size!(ControlHeader, [u8; 12]);

/// Length of [`ControlHeader`] on the wire.
pub const CONTROL_HEADER_LEN: usize = std::mem::size_of::<ControlHeader>();

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum data payload in bytes.
pub const MAX_PAYLOAD: usize = 65535;

/// Maximum service name length in bytes.
pub const MAX_SERVICE_NAME: usize = 8;

/// Largest frame accepted from a byte-stream transport.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Default forwarding budget for locally originated packets.
pub const DEFAULT_MAX_FORWARDING_HOPS: u8 = 30;

// ── Name hashing ──────────────────────────────────────────────────────────────

/// Compact identifier for a node name: the first 8 bytes of BLAKE3(name),
/// read big-endian.
pub fn name_hash(name: &str) -> u64 {
    let digest = blake3::hash(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}

/// Encode a service name into its fixed 8-byte wire field.
pub fn encode_service(name: &str) -> Result<[u8; MAX_SERVICE_NAME], WireError> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_SERVICE_NAME {
        return Err(WireError::ServiceNameTooLong(bytes.len()));
    }
    let mut field = [0u8; MAX_SERVICE_NAME];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// Decode a fixed 8-byte service field, stripping the zero padding.
pub fn decode_service(field: &[u8; MAX_SERVICE_NAME]) -> Result<String, WireError> {
    let end = field.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| WireError::InvalidServiceName)
}

// ── Routing update ────────────────────────────────────────────────────────────

/// One node's adjacency record: "I am directly connected to these peers at
/// these costs."
///
/// `(epoch, sequence)` orders records from the same origin. The epoch is the
/// origin's start time, so a restarted node supersedes its old records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingUpdate {
    pub origin: String,
    pub epoch: u64,
    pub sequence: u64,
    pub connections: BTreeMap<String, f64>,
}

impl RoutingUpdate {
    /// True if this record is strictly newer than `(epoch, sequence)`.
    pub fn supersedes(&self, epoch: u64, sequence: u64) -> bool {
        (self.epoch, self.sequence) > (epoch, sequence)
    }
}

/// Body of a control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First frame on every new link: identity plus current adjacency.
    Hello { node: String, update: RoutingUpdate },

    /// Flooded adjacency record.
    Route(RoutingUpdate),

    /// Handshake refused; the link is about to close.
    Reject { reason: String },
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// A decoded data frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub from_node: u64,
    pub from_service: String,
    pub to_node: u64,
    pub to_service: String,
    pub hops_to_live: u8,
    pub payload: Bytes,
}

impl DataFrame {
    /// Serialize to a single frame.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }
        let header = DataHeader {
            kind: FRAME_DATA,
            hops_to_live: self.hops_to_live,
            reserved: [0; 2],
            from_node: self.from_node.to_be_bytes(),
            to_node: self.to_node.to_be_bytes(),
            from_service: encode_service(&self.from_service)?,
            to_service: encode_service(&self.to_service)?,
        };
        let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Serialize a control message sent by the node whose hash is `from_node`.
pub fn encode_control(from_node: u64, message: &ControlMessage) -> Result<Bytes, WireError> {
    let header = ControlHeader {
        kind: FRAME_CONTROL,
        reserved: [0; 3],
        from_node: from_node.to_be_bytes(),
    };
    let body = serde_json::to_vec(message).map_err(|e| WireError::ControlBody(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(CONTROL_HEADER_LEN + body.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// A decoded frame of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(DataFrame),
    Control { from_node: u64, message: ControlMessage },
}

impl Frame {
    /// Parse one frame. The payload of a data frame shares `raw`'s buffer.
    pub fn decode(raw: Bytes) -> Result<Frame, WireError> {
        let kind = *raw.first().ok_or(WireError::Empty)?;
        match kind {
            FRAME_DATA => {
                let header = DataHeader::read_from_prefix(&raw[..]).ok_or(WireError::Truncated {
                    need: DATA_HEADER_LEN,
                    got: raw.len(),
                })?;
                let payload = raw.slice(DATA_HEADER_LEN..);
                if payload.len() > MAX_PAYLOAD {
                    return Err(WireError::PayloadTooLarge(payload.len()));
                }
                Ok(Frame::Data(DataFrame {
                    from_node: u64::from_be_bytes(header.from_node),
                    from_service: decode_service(&header.from_service)?,
                    to_node: u64::from_be_bytes(header.to_node),
                    to_service: decode_service(&header.to_service)?,
                    hops_to_live: header.hops_to_live,
                    payload,
                }))
            }
            FRAME_CONTROL => {
                let header =
                    ControlHeader::read_from_prefix(&raw[..]).ok_or(WireError::Truncated {
                        need: CONTROL_HEADER_LEN,
                        got: raw.len(),
                    })?;
                let message = serde_json::from_slice(&raw[CONTROL_HEADER_LEN..])
                    .map_err(|e| WireError::ControlBody(e.to_string()))?;
                Ok(Frame::Control {
                    from_node: u64::from_be_bytes(header.from_node),
                    message,
                })
            }
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when building or interpreting frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("truncated frame: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("service name is not valid UTF-8")]
    InvalidServiceName,

    #[error("service name length {0} exceeds maximum {}", MAX_SERVICE_NAME)]
    ServiceNameTooLong(usize),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("invalid control body: {0}")]
    ControlBody(String),
}

impl WireError {
    /// A well-behaved peer on a framed transport never produces these, so
    /// seeing one means frame boundaries have been lost.
    pub fn is_desync(&self) -> bool {
        matches!(self, WireError::Empty | WireError::Truncated { .. })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
