//! Driver for the first-branch ADC boards (builds 1, 2, 3 and 6).

use super::{BoardCore, BoardState, Channel, FpgaBoard, SetupCache};
use crate::transport::DirectEthernet;
use async_trait::async_trait;
use bytes::Bytes;
use ghz_core::codec::adc::{PLL_INIT_SEQUENCE, READBACK_LEN};
use ghz_core::codec::{
    decode_average_block, decode_demod_block, AdcCodec, AdcRunMode, DemodBlock, DemodConfig,
    FilterFunction, IqBlock, Readback, RegisterCodec, RegisterPacket, SramPage,
};
use ghz_core::{BoardAddress, BoardClass, FpgaError, FpgaResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Filter and demodulator tables last written to an ADC's SRAM.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AdcSetup {
    filter: FilterFunction,
    demods: DemodConfig,
}

/// Driver for one ADC board.
#[derive(Debug)]
pub struct AdcBoard {
    core: BoardCore,
    codec: AdcCodec,
}

impl AdcBoard {
    pub(crate) async fn connect(
        ethernet: Arc<dyn DirectEthernet>,
        port: u32,
        name: String,
        address: BoardAddress,
        codec: AdcCodec,
        timeout: Duration,
    ) -> FpgaResult<Self> {
        // Average packets, demodulator packets and readbacks all differ in
        // length, so no length filter is installed.
        let build = codec.build();
        let core = BoardCore::connect(ethernet, port, name, address, build, None, timeout).await?;
        Ok(Self { core, codec })
    }

    pub(crate) fn core(&self) -> &BoardCore {
        &self.core
    }

    pub fn codec(&self) -> &AdcCodec {
        &self.codec
    }

    /// Demodulator channels available on this build.
    pub fn demod_channels(&self) -> usize {
        self.codec.layout().demod_channels
    }

    fn decode(&self, reply: Option<Bytes>) -> FpgaResult<Readback> {
        match reply {
            Some(bytes) if bytes.len() == READBACK_LEN => Ok(self.codec.decode_readback(&bytes)),
            Some(bytes) => Err(FpgaError::Protocol(format!(
                "{}: readback of {} bytes, expected {}",
                self.core.name,
                bytes.len(),
                READBACK_LEN
            ))),
            None => Err(FpgaError::Protocol(format!("{}: missing readback", self.core.name))),
        }
    }

    pub(crate) async fn ping(&self, channel: &mut Channel) -> FpgaResult<Readback> {
        let reply = channel.register(self.codec.encode_ping(), true).await?;
        self.decode(reply)
    }

    async fn serial(&self, channel: &mut Channel, words: &[u32]) -> FpgaResult<()> {
        let packets = words
            .iter()
            .map(|&w| self.codec.encode_serial(w))
            .collect::<FpgaResult<Vec<_>>>()?;
        for packet in packets {
            channel.register(packet, false).await?;
        }
        Ok(())
    }

    /// Filter pages followed by trig lookup pages, encoded up front so a bad
    /// table fails before anything is sent.
    fn table_pages(&self, filter: &FilterFunction, demods: &DemodConfig) -> FpgaResult<Vec<SramPage>> {
        let mut pages = self.codec.filter_pages(filter)?;
        pages.extend(self.codec.trig_lookup_pages(demods)?);
        Ok(pages)
    }

    /// Write the filter and lookup tables in one batched packet unless the
    /// board already holds them.
    pub(crate) async fn load_tables(
        &self,
        channel: &mut Channel,
        filter: &FilterFunction,
        demods: &DemodConfig,
    ) -> FpgaResult<()> {
        let setup = SetupCache::Adc(AdcSetup {
            filter: filter.clone(),
            demods: demods.clone(),
        });
        if channel.setup_matches(&setup) {
            tracing::debug!(board = %self.core.name, "ADC tables unchanged, skipping upload");
            return Ok(());
        }
        let pages = self.table_pages(filter, demods)?;
        tracing::debug!(board = %self.core.name, pages = pages.len(), "uploading ADC tables");
        channel
            .write_batch(pages.into_iter().map(SramPage::into_bytes).collect())
            .await?;
        channel.remember_setup(Some(setup));
        Ok(())
    }

    /// Run register for a daisy-chained acquisition.
    pub(crate) fn run_packet(
        &self,
        mode: AdcRunMode,
        reps: u16,
        filter: &FilterFunction,
        demods: &DemodConfig,
        start_delay: u16,
    ) -> FpgaResult<RegisterPacket> {
        self.codec.encode_run(mode, reps, filter, demods, start_delay)
    }

    pub(crate) fn decode_average(&self, packets: &[Bytes]) -> IqBlock {
        decode_average_block(packets)
    }

    pub(crate) fn decode_demod(&self, packets: &[Bytes]) -> DemodBlock {
        decode_demod_block(packets, self.codec.layout().demod_channels_per_packet)
    }

    fn check_packets(&self, packets: &[Bytes], len: usize) -> FpgaResult<()> {
        match packets.iter().find(|p| p.len() != len) {
            Some(p) => Err(FpgaError::Protocol(format!(
                "{}: data packet of {} bytes, expected {}",
                self.core.name,
                p.len(),
                len
            ))),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Shift words into the PLL chip, in order, without readback.
    pub async fn run_serial(&self, words: &[u32]) -> FpgaResult<()> {
        let mut session = self.core.test_mode().await?;
        self.serial(&mut session, words).await
    }

    /// Recalibrate the converters. Invalidates the cached tables.
    #[instrument(skip(self), fields(board = %self.core.name))]
    pub async fn recalibrate(&self) -> FpgaResult<()> {
        let mut session = self.core.test_mode().await?;
        session.register(self.codec.encode_recalibrate(), false).await?;
        session.remember_setup(None);
        Ok(())
    }

    /// Upload the filter function and demodulator lookup tables.
    pub async fn upload_tables(&self, filter: &FilterFunction, demods: &DemodConfig) -> FpgaResult<()> {
        let mut session = self.core.lock().await?;
        self.load_tables(&mut session, filter, demods).await
    }

    /// One averaged acquisition, started immediately.
    #[instrument(skip_all, fields(board = %self.core.name))]
    pub async fn run_average(
        &self,
        filter: &FilterFunction,
        demods: &DemodConfig,
    ) -> FpgaResult<IqBlock> {
        let layout = self.codec.layout();
        let run = self.codec.encode_run(AdcRunMode::AverageAuto, 1, filter, demods, 0)?;
        let mut session = self.core.lock().await?;
        self.load_tables(&mut session, filter, demods).await?;
        let packets = session.exchange(run, layout.average_packets, None).await?;
        self.check_packets(&packets, layout.average_packet_len)?;
        Ok(self.decode_average(&packets))
    }

    /// One demodulated acquisition, started immediately.
    #[instrument(skip_all, fields(board = %self.core.name))]
    pub async fn run_demod(
        &self,
        filter: &FilterFunction,
        demods: &DemodConfig,
    ) -> FpgaResult<DemodBlock> {
        let layout = self.codec.layout();
        let run = self.codec.encode_run(AdcRunMode::DemodAuto, 1, filter, demods, 0)?;
        let mut session = self.core.lock().await?;
        self.load_tables(&mut session, filter, demods).await?;
        let packets = session.exchange(run, 1, None).await?;
        self.check_packets(&packets, layout.demod_packet_len)?;
        Ok(self.decode_demod(&packets))
    }
}

#[async_trait]
impl FpgaBoard for AdcBoard {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn address(&self) -> BoardAddress {
        self.core.address
    }

    fn build(&self) -> u8 {
        self.core.build
    }

    fn state(&self) -> BoardState {
        self.core.state()
    }

    #[instrument(skip(self), fields(board = %self.core.name))]
    async fn init_pll(&self) -> FpgaResult<()> {
        let mut session = self.core.test_mode().await?;
        self.serial(&mut session, &PLL_INIT_SEQUENCE).await?;
        session.remember_setup(None);
        tracing::info!("PLL programmed");
        Ok(())
    }

    async fn query_pll(&self) -> FpgaResult<bool> {
        if !self.codec.layout().reports_pll_lock {
            return Err(FpgaError::Unsupported {
                operation: "PLL query",
                class: BoardClass::Adc,
                build: self.core.build,
            });
        }
        let mut session = self.core.test_mode().await?;
        let reply = session.register(self.codec.encode_pll_query(), true).await?;
        Ok(self.decode(reply)?.pll_unlocked)
    }

    async fn execution_count(&self) -> FpgaResult<u16> {
        let mut session = self.core.lock().await?;
        session.clear().await?;
        Ok(self.ping(&mut session).await?.execution_count)
    }

    async fn build_number(&self) -> FpgaResult<u8> {
        let mut session = self.core.lock().await?;
        Ok(self.ping(&mut session).await?.build)
    }

    async fn disconnect(&self) -> FpgaResult<()> {
        self.core.disconnect().await
    }
}
