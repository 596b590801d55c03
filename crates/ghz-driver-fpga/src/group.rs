//! Board groups: the set of boards behind one direct-ethernet adapter port.
//!
//! A [`BoardGroup`] owns
//!
//! - a [`BoardRegistry`] of connected drivers,
//! - board detection (ping every MAC of a class in one batched packet),
//! - a group-wide lock that keeps test-mode operations and synchronized runs
//!   from interleaving, and
//! - the daisy-chain coordinator, [`BoardGroup::run_synchronized`].
//!
//! # Synchronized runs
//!
//! One board is the daisy-chain master; every other board in the chain is a
//! slave with its own start delay. Run registers are written slaves first, in
//! reverse chain order, and the master last, so the master's trigger always
//! finds every slave armed. Data is then collected from all boards
//! concurrently, each board with its own timeout.

use crate::board::{
    connect_board, AdcBoard, Board, BoardSession, DacBoard, FpgaBoard, DEFAULT_BOARD_TIMEOUT,
};
use crate::transport::{ContextId, DirectEthernet, EthernetPacket};
use bytes::Bytes;
use futures::future::join_all;
use ghz_core::codec::dac::{DEFAULT_SYNC, TIMING_VALUES_PER_PACKET};
use ghz_core::codec::{
    board_model, detection_ping, readback_build, readback_len, AdcRunMode, DacRun, DemodBlock,
    DemodConfig, FilterFunction, IqBlock, RegisterPacket, StartMode,
};
use ghz_core::{BoardAddress, BoardClass, BoardTimeout, FpgaError, FpgaResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

/// Run timeouts are this many times the nominal sequence duration.
pub const TIMEOUT_FACTOR: u32 = 10;

/// Added to every run timeout to cover network latency.
pub const DEFAULT_TIMEOUT_SLACK: Duration = Duration::from_secs(1);

/// How long detection listens for ping replies.
pub const DEFAULT_DETECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Acquisition plus packet transmit time of one ADC repetition.
pub const ADC_REP_TIME: Duration = Duration::from_micros(26);

// =============================================================================
// Registry
// =============================================================================

/// A board that answered detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedBoard {
    pub name: String,
    pub address: BoardAddress,
    pub build: u8,
}

/// Connected drivers keyed by board address.
#[derive(Debug, Default)]
pub struct BoardRegistry {
    boards: RwLock<BTreeMap<BoardAddress, Board>>,
}

impl BoardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a detected board, reusing an existing driver for the same
    /// address and build.
    pub async fn connect(
        &self,
        ethernet: Arc<dyn DirectEthernet>,
        port: u32,
        detected: &DetectedBoard,
        timeout: Duration,
    ) -> FpgaResult<Board> {
        if let Some(existing) = self.get(detected.address) {
            if existing.driver().build() == detected.build {
                return Ok(existing);
            }
            self.disconnect(detected.address).await?;
        }
        let board = connect_board(
            ethernet,
            port,
            detected.name.clone(),
            detected.address,
            detected.build,
            timeout,
        )
        .await?;
        self.boards.write().insert(detected.address, board.clone());
        Ok(board)
    }

    /// Disconnect and forget a board. Returns whether it was registered.
    pub async fn disconnect(&self, address: BoardAddress) -> FpgaResult<bool> {
        let removed = self.boards.write().remove(&address);
        match removed {
            Some(board) => {
                board.driver().disconnect().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Disconnect every board, reporting the first failure after trying all.
    pub async fn disconnect_all(&self) -> FpgaResult<()> {
        let boards = std::mem::take(&mut *self.boards.write());
        let mut first_error = None;
        for board in boards.into_values() {
            if let Err(e) = board.driver().disconnect().await {
                tracing::warn!(board = board.driver().name(), error = %e, "disconnect failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn get(&self, address: BoardAddress) -> Option<Board> {
        self.boards.read().get(&address).cloned()
    }

    /// Look a board up by device name.
    pub fn find(&self, name: &str) -> Option<Board> {
        self.boards
            .read()
            .values()
            .find(|b| b.driver().name() == name)
            .cloned()
    }

    pub fn boards(&self) -> Vec<Board> {
        self.boards.read().values().cloned().collect()
    }

    pub fn list_dacs(&self) -> Vec<Arc<DacBoard>> {
        self.boards
            .read()
            .values()
            .filter_map(|b| b.as_dac().cloned())
            .collect()
    }

    pub fn list_adcs(&self) -> Vec<Arc<AdcBoard>> {
        self.boards
            .read()
            .values()
            .filter_map(|b| b.as_adc().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.boards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.read().is_empty()
    }
}

/// Boards connected and disconnected by [`BoardGroup::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

// =============================================================================
// Daisy chain & sequences
// =============================================================================

/// Daisy-chain wiring: master first, then slaves with their start delays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaisyChain {
    pub master: BoardAddress,
    pub slaves: Vec<BoardAddress>,
    /// Start delay of each slave, in clock cycles.
    pub delays: Vec<u16>,
}

impl DaisyChain {
    pub fn new(master: BoardAddress, slaves: Vec<BoardAddress>, delays: Vec<u16>) -> Self {
        Self {
            master,
            slaves,
            delays,
        }
    }

    /// Slave and delay lists must pair up.
    pub fn validate(&self) -> FpgaResult<()> {
        if self.slaves.len() != self.delays.len() {
            return Err(FpgaError::ChainMismatch {
                slaves: self.slaves.len(),
                delays: self.delays.len(),
            });
        }
        Ok(())
    }

    /// `(board, start delay)` in chain order; the master has no delay.
    pub fn order(&self) -> Vec<(BoardAddress, u16)> {
        std::iter::once((self.master, 0))
            .chain(self.slaves.iter().copied().zip(self.delays.iter().copied()))
            .collect()
    }
}

/// Memory sequence played by a DAC board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DacSequence {
    pub sram: Vec<u32>,
    /// SRAM page, 0 or 1.
    pub page: u8,
    pub block_delay: Option<u8>,
    pub sync: u8,
    /// Duration of one repetition.
    pub rep_time: Duration,
    /// Timer values reported per repetition.
    pub timers_per_rep: usize,
}

impl DacSequence {
    pub fn new(sram: Vec<u32>, rep_time: Duration) -> Self {
        Self {
            sram,
            page: 0,
            block_delay: None,
            sync: DEFAULT_SYNC,
            rep_time,
            timers_per_rep: 1,
        }
    }

    fn packets(&self, reps: u16) -> usize {
        usize::from(reps) * self.timers_per_rep / TIMING_VALUES_PER_PACKET
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    Average,
    Demodulate,
}

/// Acquisition performed by an ADC board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcSequence {
    pub mode: AcquisitionMode,
    pub filter: FilterFunction,
    pub demods: DemodConfig,
    /// Start delay on top of the board's chain delay.
    pub start_delay: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequence {
    Dac(DacSequence),
    Adc(AdcSequence),
}

/// Data returned by one board of a synchronized run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunData {
    Timing(Vec<u16>),
    Average(IqBlock),
    Demod(DemodBlock),
    /// Packets were read and dropped.
    Discarded,
}

enum Role<'s> {
    Run {
        sequence: &'s Sequence,
        packet: RegisterPacket,
        reads: usize,
        timeout: Duration,
    },
    Idle(RegisterPacket),
}

struct Participant<'a, 's> {
    board: &'a Board,
    session: BoardSession<'a>,
    role: Role<'s>,
    slave: bool,
}

// =============================================================================
// BoardGroup
// =============================================================================

/// Settings of one board group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSettings {
    pub name: String,
    /// Adapter port the boards are cabled to.
    pub port: u32,
    pub board_timeout: Duration,
    pub detection_timeout: Duration,
    pub timeout_slack: Duration,
}

impl GroupSettings {
    pub fn new(name: impl Into<String>, port: u32) -> Self {
        Self {
            name: name.into(),
            port,
            board_timeout: DEFAULT_BOARD_TIMEOUT,
            detection_timeout: DEFAULT_DETECTION_TIMEOUT,
            timeout_slack: DEFAULT_TIMEOUT_SLACK,
        }
    }
}

/// All boards behind one adapter port.
pub struct BoardGroup {
    settings: GroupSettings,
    ethernet: Arc<dyn DirectEthernet>,
    registry: BoardRegistry,
    sync_lock: AsyncMutex<()>,
}

impl std::fmt::Debug for BoardGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardGroup")
            .field("settings", &self.settings)
            .field("boards", &self.registry.len())
            .finish()
    }
}

impl BoardGroup {
    pub fn new(ethernet: Arc<dyn DirectEthernet>, settings: GroupSettings) -> Self {
        Self {
            settings,
            ethernet,
            registry: BoardRegistry::new(),
            sync_lock: AsyncMutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &GroupSettings {
        &self.settings
    }

    pub fn registry(&self) -> &BoardRegistry {
        &self.registry
    }

    /// Run `op` while holding the group lock, so it cannot interleave with a
    /// synchronized run.
    pub async fn test_mode<F, Fut, T>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.sync_lock.lock().await;
        op().await
    }

    /// Ping every board address of both classes and report who answered.
    #[instrument(skip(self), fields(group = %self.settings.name))]
    pub async fn detect(&self) -> FpgaResult<Vec<DetectedBoard>> {
        let mut found = Vec::new();
        for class in BoardClass::ALL {
            let ctx = self.ethernet.context().await?;
            let scan = self.scan(ctx, class).await;
            self.ethernet.expire(ctx).await?;
            found.extend(scan?);
        }
        tracing::info!(boards = found.len(), "detection finished");
        Ok(found)
    }

    async fn scan(
        &self,
        ctx: ContextId,
        class: BoardClass,
    ) -> FpgaResult<Vec<DetectedBoard>> {
        let ping = detection_ping(class).into_bytes();
        let mut packet = EthernetPacket::new()
            .connect(self.settings.port)
            .require_length(readback_len(class))
            .timeout(self.settings.detection_timeout)
            .listen();
        for number in 0..=u8::MAX {
            packet = packet
                .destination_mac(BoardAddress::new(class, number).mac())
                .write(ping.clone());
        }
        let reply = self.ethernet.send(ctx, packet.collect()).await?;

        let mut found = BTreeMap::new();
        for frame in reply.reads.into_iter().flatten() {
            let Some(address) = BoardAddress::from_mac(&frame.source) else {
                continue;
            };
            if address.class != class {
                continue;
            }
            let Some(build) = readback_build(class, &frame.payload) else {
                continue;
            };
            if let Err(e) = board_model(class, build) {
                tracing::warn!(board = %address, build, error = %e, "skipping board");
                continue;
            }
            found.insert(
                address,
                DetectedBoard {
                    name: address.device_name(&self.settings.name),
                    address,
                    build,
                },
            );
        }
        Ok(found.into_values().collect())
    }

    /// Connect one detected board.
    pub async fn connect(&self, detected: &DetectedBoard) -> FpgaResult<Board> {
        self.registry
            .connect(
                Arc::clone(&self.ethernet),
                self.settings.port,
                detected,
                self.settings.board_timeout,
            )
            .await
    }

    /// Detect boards, connect the new ones and drop the ones that vanished.
    pub async fn refresh(&self) -> FpgaResult<RefreshReport> {
        let detected = self.detect().await?;
        let present: BTreeSet<BoardAddress> = detected.iter().map(|d| d.address).collect();
        let mut report = RefreshReport::default();

        for board in self.registry.boards() {
            let driver = board.driver();
            if !present.contains(&driver.address()) {
                report.removed.push(driver.name().to_string());
                self.registry.disconnect(driver.address()).await?;
            }
        }
        for board in &detected {
            let known = self
                .registry
                .get(board.address)
                .is_some_and(|b| b.driver().build() == board.build);
            if !known {
                self.connect(board).await?;
                report.added.push(board.name.clone());
            }
        }
        Ok(report)
    }

    /// Disconnect every board of the group.
    pub async fn shutdown(&self) -> FpgaResult<()> {
        self.registry.disconnect_all().await
    }

    fn run_timeout(&self, rep_time: Duration, reps: u16) -> Duration {
        rep_time
            .saturating_mul(TIMEOUT_FACTOR.saturating_mul(u32::from(reps)))
            .saturating_add(self.settings.timeout_slack)
    }

    /// Run sequences on a daisy chain and collect every board's data.
    ///
    /// The first chain board with a sequence is the master, later boards with
    /// a sequence are slaves and later DAC boards without one are idled.
    /// Results are returned in chain order.
    #[instrument(skip(self, chain, sequences), fields(group = %self.settings.name))]
    pub async fn run_synchronized(
        &self,
        chain: &DaisyChain,
        sequences: &BTreeMap<BoardAddress, Sequence>,
        reps: u16,
        collect: bool,
    ) -> FpgaResult<Vec<(BoardAddress, RunData)>> {
        chain.validate()?;
        let order = chain.order();
        if let Some(stray) = sequences.keys().find(|a| !order.iter().any(|(b, _)| b == *a)) {
            return Err(FpgaError::Protocol(format!("{stray} has a sequence but is not in the chain")));
        }

        let mut boards = Vec::new();
        for &(address, delay) in &order {
            let board = self
                .registry
                .get(address)
                .ok_or(FpgaError::NotConnected(address))?;
            boards.push((board, delay));
        }

        // Build every register before touching the wire.
        let mut plan: Vec<(usize, Role<'_>, bool)> = Vec::new();
        let mut master_seen = false;
        for (index, (board, delay)) in boards.iter().enumerate() {
            let address = board.driver().address();
            match sequences.get(&address) {
                Some(sequence) => {
                    let slave = master_seen;
                    let role = self.run_role(board, sequence, *delay, slave, reps)?;
                    master_seen = true;
                    plan.push((index, role, slave));
                }
                None if master_seen => {
                    if let Some(dac) = board.as_dac() {
                        let delay = u8::try_from(*delay).map_err(|_| FpgaError::OperandOverflow {
                            field: "idle start delay",
                            value: u64::from(*delay),
                            bits: 8,
                        })?;
                        plan.push((index, Role::Idle(dac.idle_packet(delay)), true));
                    }
                }
                None => {}
            }
        }
        if !master_seen {
            return Err(FpgaError::Protocol("no board in the chain has a sequence".into()));
        }

        let _run = self.sync_lock.lock().await;
        let mut participants = Vec::with_capacity(plan.len());
        for (index, role, slave) in plan {
            let board = &boards[index].0;
            participants.push(Participant {
                board,
                session: board.core().lock().await?,
                role,
                slave,
            });
        }

        for p in participants.iter_mut() {
            if let Role::Run { sequence, .. } = &p.role {
                load_setup(p.board, &mut p.session, sequence).await?;
                p.session.clear().await?;
            }
        }

        // Slaves in reverse chain order, master last.
        let master = participants.iter().position(|p| !p.slave);
        let issue: Vec<usize> = (0..participants.len())
            .rev()
            .filter(|&i| Some(i) != master)
            .chain(master)
            .collect();
        for i in issue {
            let p = &mut participants[i];
            let packet = match &p.role {
                Role::Run { packet, .. } => packet.clone(),
                Role::Idle(packet) => packet.clone(),
            };
            tracing::debug!(board = p.board.driver().name(), slave = p.slave, "run register");
            p.session.register(packet, false).await?;
        }

        let results = join_all(
            participants
                .iter_mut()
                .filter(|p| matches!(p.role, Role::Run { .. }))
                .map(|p| read_run(p, collect)),
        )
        .await;

        let mut data = Vec::with_capacity(results.len());
        let mut timed_out = Vec::new();
        let runners = participants
            .iter_mut()
            .filter(|p| matches!(p.role, Role::Run { .. }));
        for (p, result) in runners.zip(results) {
            let address = p.board.driver().address();
            match result {
                Ok(run) => data.push((address, run)),
                Err(FpgaError::Timeout { .. }) => {
                    let executed = executed_count(p).await;
                    tracing::warn!(board = %address, ?executed, "board timed out");
                    timed_out.push(BoardTimeout {
                        board: address,
                        expected: u32::from(reps),
                        executed,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        if !timed_out.is_empty() {
            return Err(FpgaError::BoardsTimedOut(timed_out));
        }
        Ok(data)
    }

    fn run_role<'s>(
        &self,
        board: &Board,
        sequence: &'s Sequence,
        delay: u16,
        slave: bool,
        reps: u16,
    ) -> FpgaResult<Role<'s>> {
        let address = board.driver().address();
        match (board, sequence) {
            (Board::Dac(dac), Sequence::Dac(seq)) => {
                let packet = dac.run_packet(&DacRun {
                    reps,
                    page: seq.page,
                    mode: if slave { StartMode::Slave } else { StartMode::Master },
                    delay,
                    block_delay: seq.block_delay,
                    sync: seq.sync,
                })?;
                Ok(Role::Run {
                    sequence,
                    packet,
                    reads: seq.packets(reps),
                    timeout: self.run_timeout(seq.rep_time, reps),
                })
            }
            (Board::Adc(adc), Sequence::Adc(seq)) => {
                if !slave {
                    return Err(FpgaError::InvalidMaster(address));
                }
                let (mode, reads) = match seq.mode {
                    AcquisitionMode::Average => {
                        (AdcRunMode::AverageDaisy, adc.codec().layout().average_packets)
                    }
                    AcquisitionMode::Demodulate => (AdcRunMode::DemodDaisy, usize::from(reps)),
                };
                let start_delay =
                    seq.start_delay
                        .checked_add(delay)
                        .ok_or_else(|| FpgaError::OperandOverflow {
                            field: "ADC start delay",
                            value: u64::from(seq.start_delay) + u64::from(delay),
                            bits: 16,
                        })?;
                let packet = adc.run_packet(mode, reps, &seq.filter, &seq.demods, start_delay)?;
                Ok(Role::Run {
                    sequence,
                    packet,
                    reads,
                    timeout: self.run_timeout(ADC_REP_TIME, reps),
                })
            }
            _ => Err(FpgaError::Protocol(format!(
                "{address} cannot run a {} sequence",
                match sequence {
                    Sequence::Dac(_) => BoardClass::Dac,
                    Sequence::Adc(_) => BoardClass::Adc,
                }
            ))),
        }
    }
}

async fn load_setup(board: &Board, session: &mut BoardSession<'_>, sequence: &Sequence) -> FpgaResult<()> {
    match (board, sequence) {
        (Board::Dac(dac), Sequence::Dac(seq)) => {
            dac.load_sram(session, &seq.sram, usize::from(seq.page)).await
        }
        (Board::Adc(adc), Sequence::Adc(seq)) => {
            adc.load_tables(session, &seq.filter, &seq.demods).await
        }
        _ => Ok(()),
    }
}

async fn read_run(p: &mut Participant<'_, '_>, collect: bool) -> FpgaResult<RunData> {
    let Role::Run {
        sequence,
        reads,
        timeout,
        ..
    } = &p.role
    else {
        return Ok(RunData::Discarded);
    };
    let packets: Vec<Bytes> = if *reads == 0 {
        Vec::new()
    } else {
        p.session.read(*reads, *timeout).await?
    };
    if !collect {
        return Ok(RunData::Discarded);
    }
    Ok(match (p.board, sequence) {
        (Board::Dac(dac), _) => RunData::Timing(dac.codec().decode_timing(&packets)),
        (Board::Adc(adc), Sequence::Adc(seq)) => match seq.mode {
            AcquisitionMode::Average => RunData::Average(adc.decode_average(&packets)),
            AcquisitionMode::Demodulate => RunData::Demod(adc.decode_demod(&packets)),
        },
        (Board::Adc(_), Sequence::Dac(_)) => RunData::Discarded,
    })
}

/// Drop whatever a late board queued and ask how far it got.
async fn executed_count(p: &mut Participant<'_, '_>) -> Option<u16> {
    if p.session.clear().await.is_err() {
        return None;
    }
    let readback = match p.board {
        Board::Dac(dac) => dac.ping(&mut p.session).await,
        Board::Adc(adc) => adc.ping(&mut p.session).await,
    };
    readback.ok().map(|rb| rb.execution_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_validation() {
        let chain = DaisyChain::new(BoardAddress::dac(1), vec![BoardAddress::dac(2)], vec![]);
        assert!(matches!(
            chain.validate(),
            Err(FpgaError::ChainMismatch { slaves: 1, delays: 0 })
        ));
        let chain = DaisyChain::new(
            BoardAddress::dac(1),
            vec![BoardAddress::dac(2), BoardAddress::adc(3)],
            vec![4, 9],
        );
        assert!(chain.validate().is_ok());
        assert_eq!(
            chain.order(),
            vec![
                (BoardAddress::dac(1), 0),
                (BoardAddress::dac(2), 4),
                (BoardAddress::adc(3), 9)
            ]
        );
    }

    #[test]
    fn test_dac_packet_count_drops_partial_packet() {
        let mut seq = DacSequence::new(vec![0; 4], Duration::from_micros(10));
        assert_eq!(seq.packets(29), 0);
        assert_eq!(seq.packets(60), 2);
        seq.timers_per_rep = 3;
        assert_eq!(seq.packets(25), 2);
    }

    #[test]
    fn test_run_timeout_scales_with_reps() {
        let group = BoardGroup::new(
            Arc::new(crate::transport::EmulatedEthernet::new(1)),
            GroupSettings::new("g", 1),
        );
        assert_eq!(
            group.run_timeout(Duration::from_micros(100), 1000),
            Duration::from_secs(2)
        );
        assert_eq!(group.run_timeout(ADC_REP_TIME, 0), DEFAULT_TIMEOUT_SLACK);
    }
}
