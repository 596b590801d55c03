//! Board drivers.
//!
//! A driver owns one board's [`Connection`] and serializes every register and
//! SRAM exchange through an async mutex, so at most one read-expecting request
//! is ever in flight per board. Drivers move through
//!
//! ```text
//! Disconnected -> Connected -> (TestMode <-> Idle) -> Disconnected
//! ```
//!
//! `TestMode` is held for the duration of any bring-up or diagnostic
//! operation; `Idle` is the resting state used for data taking.
//!
//! [`connect_board`] picks the driver for a `(class, build)` pair through
//! [`board_model`], so an unknown firmware build fails at connect time.

mod adc;
mod connection;
mod dac;

pub use adc::AdcBoard;
pub use connection::{Connection, DEFAULT_BOARD_TIMEOUT};
pub use dac::{BistReading, DacBoard, FifoReading, LvdsReading, LvdsSetting};

use crate::transport::DirectEthernet;
use async_trait::async_trait;
use bytes::Bytes;
use ghz_core::codec::{board_model, BoardModel, RegisterPacket};
use ghz_core::{BoardAddress, BoardClass, FpgaError, FpgaResult};
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// Lifecycle state of a board driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardState {
    Disconnected,
    Connected,
    TestMode,
    Idle,
}

impl fmt::Display for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BoardState::Disconnected => "disconnected",
            BoardState::Connected => "connected",
            BoardState::TestMode => "test mode",
            BoardState::Idle => "idle",
        };
        write!(f, "{}", label)
    }
}

/// Last SRAM contents uploaded to a board, used to skip identical uploads.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SetupCache {
    Dac { page: usize, words: Vec<u32> },
    Adc(adc::AdcSetup),
}

/// Everything guarded by a board's lock.
#[derive(Debug)]
pub struct Channel {
    connection: Option<Connection>,
    address: BoardAddress,
    last_setup: Option<SetupCache>,
}

impl Channel {
    fn connection(&self) -> FpgaResult<&Connection> {
        self.connection
            .as_ref()
            .ok_or(FpgaError::NotConnected(self.address))
    }

    /// Send a register packet, optionally waiting for its readback.
    pub(crate) async fn register(
        &mut self,
        packet: RegisterPacket,
        readback: bool,
    ) -> FpgaResult<Option<Bytes>> {
        self.connection()?
            .send_and_maybe_read(packet.into_bytes(), readback, None)
            .await
    }

    /// Several register packets in one round trip, reading one reply per
    /// packet when `readback` is set.
    pub(crate) async fn registers(
        &mut self,
        packets: Vec<RegisterPacket>,
        readback: bool,
    ) -> FpgaResult<Vec<Bytes>> {
        let reads = if readback { packets.len() } else { 0 };
        let payloads = packets.into_iter().map(RegisterPacket::into_bytes).collect();
        self.connection()?.request(payloads, reads, None).await
    }

    /// Send a run register and collect `reads` data packets in the same
    /// round trip.
    pub(crate) async fn exchange(
        &mut self,
        packet: RegisterPacket,
        reads: usize,
        timeout: Option<Duration>,
    ) -> FpgaResult<Vec<Bytes>> {
        self.connection()?
            .request(vec![packet.into_bytes()], reads, timeout)
            .await
    }

    pub(crate) async fn write_batch(&mut self, payloads: Vec<Bytes>) -> FpgaResult<()> {
        self.connection()?.write_batch(payloads).await
    }

    pub(crate) async fn read(&mut self, count: usize, timeout: Duration) -> FpgaResult<Vec<Bytes>> {
        self.connection()?.read(count, timeout).await
    }

    pub(crate) async fn clear(&mut self) -> FpgaResult<()> {
        self.connection()?.clear().await
    }

    pub(crate) fn setup_matches(&self, setup: &SetupCache) -> bool {
        self.last_setup.as_ref() == Some(setup)
    }

    pub(crate) fn remember_setup(&mut self, setup: Option<SetupCache>) {
        self.last_setup = setup;
    }
}

/// Exclusive access to a board. Leaving test mode returns the board to idle.
pub struct BoardSession<'a> {
    channel: MutexGuard<'a, Channel>,
    state: &'a Mutex<BoardState>,
}

impl Deref for BoardSession<'_> {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl DerefMut for BoardSession<'_> {
    fn deref_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }
}

impl Drop for BoardSession<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if *state != BoardState::Disconnected {
            *state = BoardState::Idle;
        }
    }
}

/// State shared by every driver: identity, lifecycle and the board lock.
#[derive(Debug)]
pub(crate) struct BoardCore {
    name: String,
    address: BoardAddress,
    build: u8,
    state: Mutex<BoardState>,
    channel: AsyncMutex<Channel>,
}

impl BoardCore {
    async fn connect(
        ethernet: Arc<dyn DirectEthernet>,
        port: u32,
        name: String,
        address: BoardAddress,
        build: u8,
        length_filter: Option<usize>,
        timeout: Duration,
    ) -> FpgaResult<Self> {
        let connection = Connection::open(ethernet, port, address, length_filter, timeout).await?;
        tracing::info!(board = %name, build, "board connected");
        Ok(Self {
            name,
            address,
            build,
            state: Mutex::new(BoardState::Connected),
            channel: AsyncMutex::new(Channel {
                connection: Some(connection),
                address,
                last_setup: None,
            }),
        })
    }

    fn state(&self) -> BoardState {
        *self.state.lock()
    }

    async fn enter(&self, next: BoardState) -> FpgaResult<BoardSession<'_>> {
        let channel = self.channel.lock().await;
        if channel.connection.is_none() {
            return Err(FpgaError::NotConnected(self.address));
        }
        *self.state.lock() = next;
        Ok(BoardSession {
            channel,
            state: &self.state,
        })
    }

    /// Lock the board for data taking.
    pub(crate) async fn lock(&self) -> FpgaResult<BoardSession<'_>> {
        self.enter(BoardState::Idle).await
    }

    /// Lock the board for a bring-up or diagnostic operation.
    pub(crate) async fn test_mode(&self) -> FpgaResult<BoardSession<'_>> {
        self.enter(BoardState::TestMode).await
    }

    async fn disconnect(&self) -> FpgaResult<()> {
        let mut channel = self.channel.lock().await;
        *self.state.lock() = BoardState::Disconnected;
        match channel.connection.take() {
            Some(connection) => {
                tracing::info!(board = %self.name, "board disconnected");
                connection.close().await
            }
            None => Ok(()),
        }
    }
}

/// Operations every board class supports.
#[async_trait]
pub trait FpgaBoard: Send + Sync {
    fn name(&self) -> &str;
    fn address(&self) -> BoardAddress;
    /// Firmware build recorded at connect time.
    fn build(&self) -> u8;
    fn state(&self) -> BoardState;

    /// Program the on-board PLL chip.
    async fn init_pll(&self) -> FpgaResult<()>;

    /// True when the PLL reports it has lost lock.
    async fn query_pll(&self) -> FpgaResult<bool>;

    /// Executions the board has performed since power-up, read from a
    /// fresh readback. Stale frames queued for the board are dropped first.
    async fn execution_count(&self) -> FpgaResult<u16>;

    /// Firmware build as reported by the board itself.
    async fn build_number(&self) -> FpgaResult<u8>;

    async fn disconnect(&self) -> FpgaResult<()>;
}

/// A connected driver of either class.
#[derive(Clone)]
pub enum Board {
    Dac(Arc<DacBoard>),
    Adc(Arc<AdcBoard>),
}

impl Board {
    pub fn class(&self) -> BoardClass {
        match self {
            Board::Dac(_) => BoardClass::Dac,
            Board::Adc(_) => BoardClass::Adc,
        }
    }

    pub fn as_dac(&self) -> Option<&Arc<DacBoard>> {
        match self {
            Board::Dac(dac) => Some(dac),
            Board::Adc(_) => None,
        }
    }

    pub fn as_adc(&self) -> Option<&Arc<AdcBoard>> {
        match self {
            Board::Adc(adc) => Some(adc),
            Board::Dac(_) => None,
        }
    }

    pub(crate) fn core(&self) -> &BoardCore {
        match self {
            Board::Dac(dac) => dac.core(),
            Board::Adc(adc) => adc.core(),
        }
    }

    pub fn driver(&self) -> &dyn FpgaBoard {
        match self {
            Board::Dac(dac) => &**dac,
            Board::Adc(adc) => &**adc,
        }
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let driver = self.driver();
        f.debug_struct("Board")
            .field("name", &driver.name())
            .field("address", &driver.address())
            .field("build", &driver.build())
            .field("state", &driver.state())
            .finish()
    }
}

/// Connect the driver matching `(address.class, build)`.
pub async fn connect_board(
    ethernet: Arc<dyn DirectEthernet>,
    port: u32,
    name: impl Into<String>,
    address: BoardAddress,
    build: u8,
    timeout: Duration,
) -> FpgaResult<Board> {
    let name = name.into();
    match board_model(address.class, build)? {
        BoardModel::Dac(codec) => {
            let board = DacBoard::connect(ethernet, port, name, address, codec, timeout).await?;
            Ok(Board::Dac(Arc::new(board)))
        }
        BoardModel::Adc(codec) => {
            let board = AdcBoard::connect(ethernet, port, name, address, codec, timeout).await?;
            Ok(Board::Adc(Arc::new(board)))
        }
    }
}
