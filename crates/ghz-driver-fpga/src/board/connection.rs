//! One board's logical channel on a direct-ethernet server.

use crate::transport::{ContextId, DirectEthernet, EthernetPacket};
use bytes::Bytes;
use ghz_core::{BoardAddress, FpgaError, FpgaResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default read timeout for register readbacks.
pub const DEFAULT_BOARD_TIMEOUT: Duration = Duration::from_secs(1);

/// A context scoped to a single board address.
///
/// The context only ever sees frames whose source MAC is the board's own, and,
/// when a length filter is installed, only frames of that length. A
/// `Connection` assumes a single outstanding read at a time; the board
/// drivers guarantee this by only touching it while holding their lock.
pub struct Connection {
    ethernet: Arc<dyn DirectEthernet>,
    ctx: ContextId,
    address: BoardAddress,
    port: u32,
    timeout: Duration,
    closed: AtomicBool,
}

impl Connection {
    /// Open a context, install the board filters and arm the timeout.
    pub async fn open(
        ethernet: Arc<dyn DirectEthernet>,
        port: u32,
        address: BoardAddress,
        length_filter: Option<usize>,
        timeout: Duration,
    ) -> FpgaResult<Self> {
        let ctx = ethernet.context().await?;
        let mac = address.mac();
        let mut setup = EthernetPacket::new()
            .connect(port)
            .destination_mac(mac)
            .require_source_mac(mac);
        if let Some(len) = length_filter {
            setup = setup.require_length(len);
        }
        let setup = setup.timeout(timeout).listen();

        if let Err(e) = ethernet.send(ctx, setup).await {
            ethernet.expire(ctx).await.ok();
            return Err(match e {
                FpgaError::Connection(msg) => {
                    FpgaError::Connection(format!("{address} on port {port}: {msg}"))
                }
                other => other,
            });
        }

        tracing::debug!(board = %address, %mac, %ctx, port, "board connection opened");
        Ok(Self {
            ethernet,
            ctx,
            address,
            port,
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> BoardAddress {
        self.address
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> FpgaResult<()> {
        if self.is_closed() {
            return Err(FpgaError::NotConnected(self.address));
        }
        Ok(())
    }

    /// Write `payload` and, if asked, wait for one reply frame.
    pub async fn send_and_maybe_read(
        &self,
        payload: impl Into<Bytes>,
        expect_readback: bool,
        timeout: Option<Duration>,
    ) -> FpgaResult<Option<Bytes>> {
        let reads = usize::from(expect_readback);
        let mut replies = self.request(vec![payload.into()], reads, timeout).await?;
        Ok(replies.pop())
    }

    /// Write every payload in one batched packet, with no readback.
    pub async fn write_batch(&self, payloads: Vec<Bytes>) -> FpgaResult<()> {
        self.request(payloads, 0, None).await.map(|_| ())
    }

    /// Write `payloads` in order, then read `reads` reply frames, all in one
    /// packet. `timeout` overrides the connection timeout for this packet.
    pub async fn request(
        &self,
        payloads: Vec<Bytes>,
        reads: usize,
        timeout: Option<Duration>,
    ) -> FpgaResult<Vec<Bytes>> {
        self.check_open()?;
        let mut packet = EthernetPacket::new().timeout(timeout.unwrap_or(self.timeout));
        for payload in payloads {
            packet = packet.write(payload);
        }
        if reads > 0 {
            packet = packet.read(reads);
        }
        let reply = self.ethernet.send(self.ctx, packet).await?;
        Ok(reply.last_read())
    }

    /// Wait for `count` frames already on their way.
    pub async fn read(&self, count: usize, timeout: Duration) -> FpgaResult<Vec<Bytes>> {
        self.request(Vec::new(), count, Some(timeout)).await
    }

    /// Drop everything queued for this board.
    pub async fn clear(&self) -> FpgaResult<()> {
        self.check_open()?;
        self.ethernet
            .send(self.ctx, EthernetPacket::new().clear())
            .await
            .map(|_| ())
    }

    /// Release the context. Safe to call more than once.
    pub async fn close(&self) -> FpgaResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(board = %self.address, ctx = %self.ctx, "board connection closed");
        self.ethernet.expire(self.ctx).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("ctx", &self.ctx)
            .field("port", &self.port)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::DacEmulator;
    use crate::transport::EmulatedEthernet;

    fn ping() -> Bytes {
        let mut ping = vec![0u8; 56];
        ping[1] = 1;
        Bytes::from(ping)
    }

    #[tokio::test]
    async fn test_open_fails_on_missing_port() {
        let ethernet = Arc::new(EmulatedEthernet::new(1));
        let result = Connection::open(
            ethernet.clone(),
            7,
            BoardAddress::dac(1),
            None,
            DEFAULT_BOARD_TIMEOUT,
        )
        .await;
        assert!(matches!(result, Err(FpgaError::Connection(_))));
        assert_eq!(ethernet.open_contexts(), 0);
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let ethernet = Arc::new(EmulatedEthernet::new(1));
        ethernet.attach(DacEmulator::new(1, 8));
        let conn = Connection::open(
            ethernet.clone(),
            1,
            BoardAddress::dac(1),
            Some(70),
            DEFAULT_BOARD_TIMEOUT,
        )
        .await
        .unwrap();

        let reply = conn.send_and_maybe_read(ping(), true, None).await.unwrap();
        assert_eq!(reply.map(|r| r[51]), Some(8));
        let silent = Bytes::from(vec![0u8; 56]);
        let none = conn.send_and_maybe_read(silent, false, None).await.unwrap();
        assert!(none.is_none());

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(ethernet.open_contexts(), 0);
        assert!(matches!(
            conn.send_and_maybe_read(ping(), true, None).await,
            Err(FpgaError::NotConnected(_))
        ));
    }
}
