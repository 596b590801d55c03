//! In-process direct-ethernet adapter backed by board emulators.

use super::context::FrameSink;
use super::{ContextId, ContextTable, DirectEthernet, EthernetPacket, EthernetReply, Frame};
use crate::emulator::BoardEmulator;
use async_trait::async_trait;
use ghz_core::{FpgaResult, MacAddress};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Host MAC used when none is configured.
pub const DEFAULT_HOST_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

type SharedEmulator = Arc<Mutex<dyn BoardEmulator>>;

/// Direct-ethernet adapter with one emulated port.
///
/// Frames written to a MAC with an attached emulator are handed to it
/// synchronously and its replies are queued on the listening contexts before
/// the write returns. Every transmitted frame is recorded in a transcript so
/// tests can check issue order.
///
/// # Example
///
/// ```rust
/// use ghz_driver_fpga::emulator::DacEmulator;
/// use ghz_driver_fpga::transport::EmulatedEthernet;
///
/// let ethernet = EmulatedEthernet::new(1);
/// let dac = ethernet.attach(DacEmulator::new(3, 8));
/// assert_eq!(dac.lock().build(), 8);
/// ```
pub struct EmulatedEthernet {
    port: u32,
    host_mac: MacAddress,
    table: ContextTable,
    boards: Mutex<HashMap<MacAddress, SharedEmulator>>,
    muted: Mutex<HashSet<MacAddress>>,
    transcript: Mutex<Vec<Frame>>,
}

impl EmulatedEthernet {
    pub fn new(port: u32) -> Self {
        Self::with_host_mac(port, DEFAULT_HOST_MAC)
    }

    pub fn with_host_mac(port: u32, host_mac: MacAddress) -> Self {
        Self {
            port,
            host_mac,
            table: ContextTable::new(),
            boards: Mutex::new(HashMap::new()),
            muted: Mutex::new(HashSet::new()),
            transcript: Mutex::new(Vec::new()),
        }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Attach an emulator and return a handle for inspecting its state.
    pub fn attach<E: BoardEmulator + 'static>(&self, emulator: E) -> Arc<Mutex<E>> {
        let handle = Arc::new(Mutex::new(emulator));
        let mac = handle.lock().mac();
        let shared: SharedEmulator = handle.clone();
        self.boards.lock().insert(mac, shared);
        tracing::debug!(%mac, "emulated board attached");
        handle
    }

    /// Unplug a board. Later writes to it go nowhere.
    pub fn detach(&self, mac: MacAddress) -> bool {
        self.boards.lock().remove(&mac).is_some()
    }

    /// Silence a board: it still receives frames but never replies.
    pub fn set_muted(&self, mac: MacAddress, muted: bool) {
        let mut set = self.muted.lock();
        if muted {
            set.insert(mac);
        } else {
            set.remove(&mac);
        }
    }

    /// Every frame transmitted so far, oldest first.
    pub fn transcript(&self) -> Vec<Frame> {
        self.transcript.lock().clone()
    }

    pub fn clear_transcript(&self) {
        self.transcript.lock().clear();
    }

    /// Open contexts, for leak checks.
    pub fn open_contexts(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl FrameSink for EmulatedEthernet {
    fn has_port(&self, port: u32) -> bool {
        port == self.port
    }

    async fn transmit(&self, port: u32, frame: Frame) -> FpgaResult<()> {
        self.transcript.lock().push(frame.clone());
        let board = self.boards.lock().get(&frame.destination).cloned();
        let Some(board) = board else {
            return Ok(());
        };
        let replies = board.lock().handle(&frame.payload);
        if self.muted.lock().contains(&frame.destination) {
            return Ok(());
        }
        for payload in replies {
            self.table.dispatch(
                port,
                Frame {
                    source: frame.destination,
                    destination: frame.source,
                    payload,
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl DirectEthernet for EmulatedEthernet {
    async fn context(&self) -> FpgaResult<ContextId> {
        Ok(self.table.allocate())
    }

    async fn send(&self, ctx: ContextId, packet: EthernetPacket) -> FpgaResult<EthernetReply> {
        self.table.execute(self, self.host_mac, ctx, packet).await
    }

    async fn expire(&self, ctx: ContextId) -> FpgaResult<()> {
        self.table.expire(ctx);
        Ok(())
    }

    fn host_mac(&self) -> MacAddress {
        self.host_mac
    }
}

impl std::fmt::Debug for EmulatedEthernet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedEthernet")
            .field("port", &self.port)
            .field("host_mac", &self.host_mac)
            .field("boards", &self.boards.lock().len())
            .finish()
    }
}
