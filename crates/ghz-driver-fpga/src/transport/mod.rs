//! Direct-ethernet transport contract.
//!
//! Boards speak raw ethernet frames. A direct-ethernet server owns the
//! network adapters and hands out *contexts*: each context carries its own
//! adapter port, destination MAC, receive filters, timeout and receive queue.
//! Requests are built as an [`EthernetPacket`], an ordered list of operations
//! that the server executes atomically, so a whole board configuration can be
//! shipped in a single round trip.
//!
//! Two implementations are provided:
//!
//! - [`EmulatedEthernet`] - in-process adapter with attached board emulators
//! - [`RelayEthernet`] - TCP client for a frame relay on the lab network

mod context;
mod emulated;
mod relay;

pub use context::ContextTable;
pub use emulated::EmulatedEthernet;
pub use relay::{decode_relay_frame, encode_relay_frame, RelayEthernet};

use async_trait::async_trait;
use bytes::Bytes;
use ghz_core::{FpgaResult, MacAddress};
use std::fmt;
use std::time::Duration;

/// Identifier of a context on a direct-ethernet server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// One raw ethernet frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: MacAddress,
    pub destination: MacAddress,
    pub payload: Bytes,
}

/// A single operation inside an [`EthernetPacket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthernetOp {
    /// Bind the context to an adapter port.
    Connect(u32),
    DestinationMac(MacAddress),
    /// Only accept frames from this source.
    RequireSourceMac(MacAddress),
    /// Only accept frames with exactly this payload length.
    RequireLength(usize),
    Timeout(Duration),
    /// Start queueing matching frames.
    Listen,
    /// Drop everything queued so far.
    Clear,
    Write(Bytes),
    /// Wait for `n` frames, failing on timeout.
    Read(usize),
    /// Wait for `n` frames and drop them.
    Discard(usize),
    /// Wait out the timeout and return everything that arrived.
    Collect,
}

/// Ordered batch of operations executed atomically by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EthernetPacket {
    ops: Vec<EthernetOp>,
}

impl EthernetPacket {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, op: EthernetOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn connect(self, port: u32) -> Self {
        self.push(EthernetOp::Connect(port))
    }

    pub fn destination_mac(self, mac: MacAddress) -> Self {
        self.push(EthernetOp::DestinationMac(mac))
    }

    pub fn require_source_mac(self, mac: MacAddress) -> Self {
        self.push(EthernetOp::RequireSourceMac(mac))
    }

    pub fn require_length(self, len: usize) -> Self {
        self.push(EthernetOp::RequireLength(len))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.push(EthernetOp::Timeout(timeout))
    }

    pub fn listen(self) -> Self {
        self.push(EthernetOp::Listen)
    }

    pub fn clear(self) -> Self {
        self.push(EthernetOp::Clear)
    }

    pub fn write(self, payload: impl Into<Bytes>) -> Self {
        self.push(EthernetOp::Write(payload.into()))
    }

    pub fn read(self, frames: usize) -> Self {
        self.push(EthernetOp::Read(frames))
    }

    pub fn discard(self, frames: usize) -> Self {
        self.push(EthernetOp::Discard(frames))
    }

    pub fn collect(self) -> Self {
        self.push(EthernetOp::Collect)
    }

    pub fn ops(&self) -> &[EthernetOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of write operations in the batch.
    pub fn writes(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, EthernetOp::Write(_)))
            .count()
    }
}

/// Frames returned by the read operations of one packet, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EthernetReply {
    pub reads: Vec<Vec<Frame>>,
}

impl EthernetReply {
    /// Payloads of every read, flattened.
    pub fn payloads(&self) -> Vec<Bytes> {
        self.reads
            .iter()
            .flatten()
            .map(|frame| frame.payload.clone())
            .collect()
    }

    /// Payloads of the last read, which is the one callers usually want.
    pub fn last_read(&self) -> Vec<Bytes> {
        self.reads
            .last()
            .map(|frames| frames.iter().map(|f| f.payload.clone()).collect())
            .unwrap_or_default()
    }
}

/// Client side of a direct-ethernet server.
#[async_trait]
pub trait DirectEthernet: Send + Sync {
    /// Allocate a fresh context.
    async fn context(&self) -> FpgaResult<ContextId>;

    /// Execute a packet in `ctx`.
    async fn send(&self, ctx: ContextId, packet: EthernetPacket) -> FpgaResult<EthernetReply>;

    /// Release a context and its filters. Unknown contexts are ignored.
    async fn expire(&self, ctx: ContextId) -> FpgaResult<()>;

    /// MAC address frames are sent from.
    fn host_mac(&self) -> MacAddress;
}
