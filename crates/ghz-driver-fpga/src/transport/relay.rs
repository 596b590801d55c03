//! TCP client for a direct-ethernet frame relay.
//!
//! The relay runs next to the network adapters and forwards raw frames in
//! both directions. Each frame on the TCP stream is
//!
//! ```text
//! u32 BE length | port (1 byte) | destination MAC (6) | source MAC (6) | payload
//! ```
//!
//! where `length` counts everything after itself. Filtering, timeouts and
//! packet batching are done client side by the shared [`ContextTable`].

use super::context::FrameSink;
use super::{ContextId, ContextTable, DirectEthernet, EthernetPacket, EthernetReply, Frame};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use ghz_core::{FpgaError, FpgaResult, MacAddress};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default relay port.
pub const DEFAULT_RELAY_PORT: u16 = 7878;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEADER_LEN: usize = 1 + 6 + 6;
/// Largest ethernet payload plus header.
const MAX_FRAME_LEN: usize = HEADER_LEN + 9000;

/// Serialise a frame for the relay stream.
pub fn encode_relay_frame(port: u32, frame: &Frame) -> FpgaResult<Bytes> {
    let port = u8::try_from(port).map_err(|_| FpgaError::OperandOverflow {
        field: "relay adapter port",
        value: u64::from(port),
        bits: 8,
    })?;
    let len = HEADER_LEN + frame.payload.len();
    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    buf.put_u8(port);
    buf.put_slice(&frame.destination.octets());
    buf.put_slice(&frame.source.octets());
    buf.put_slice(&frame.payload);
    Ok(buf.freeze())
}

/// Parse the body of one relay frame (everything after the length prefix).
pub fn decode_relay_frame(body: &[u8]) -> FpgaResult<(u32, Frame)> {
    if body.len() < HEADER_LEN {
        return Err(FpgaError::Protocol(format!(
            "relay frame of {} bytes is shorter than its header",
            body.len()
        )));
    }
    let mac = |offset: usize| {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&body[offset..offset + 6]);
        MacAddress::new(octets)
    };
    let frame = Frame {
        destination: mac(1),
        source: mac(7),
        payload: Bytes::copy_from_slice(&body[HEADER_LEN..]),
    };
    Ok((u32::from(body[0]), frame))
}

struct RelaySink {
    writer: Mutex<OwnedWriteHalf>,
}

#[async_trait]
impl FrameSink for RelaySink {
    fn has_port(&self, port: u32) -> bool {
        port <= u32::from(u8::MAX)
    }

    async fn transmit(&self, port: u32, frame: Frame) -> FpgaResult<()> {
        let bytes = encode_relay_frame(port, &frame)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Direct-ethernet client talking to a frame relay over TCP.
pub struct RelayEthernet {
    address: String,
    host_mac: MacAddress,
    table: Arc<ContextTable>,
    sink: RelaySink,
    reader: JoinHandle<()>,
}

impl RelayEthernet {
    /// Connect to the relay at `address` (`host:port`).
    pub async fn connect(address: &str, host_mac: MacAddress) -> FpgaResult<Self> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| FpgaError::Connection(format!("timed out connecting to {address}")))?
            .map_err(|e| FpgaError::Connection(format!("failed to connect to {address}: {e}")))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let table = Arc::new(ContextTable::new());
        let reader = tokio::spawn(read_frames(read_half, Arc::clone(&table)));

        tracing::info!(%address, %host_mac, "connected to frame relay");
        Ok(Self {
            address: address.to_string(),
            host_mac,
            table,
            sink: RelaySink {
                writer: Mutex::new(write_half),
            },
            reader,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// False once the relay closed the stream.
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }
}

async fn read_frames(mut reader: OwnedReadHalf, table: Arc<ContextTable>) {
    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) => {
                tracing::info!(error = %e, "frame relay closed");
                return;
            }
        };
        if len > MAX_FRAME_LEN {
            tracing::error!(len, "oversized relay frame, dropping connection");
            return;
        }
        let mut body = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut body).await {
            tracing::warn!(error = %e, "truncated relay frame");
            return;
        }
        match decode_relay_frame(&body) {
            Ok((port, frame)) => {
                table.dispatch(port, frame);
            }
            Err(e) => tracing::warn!(error = %e, "discarding malformed relay frame"),
        }
    }
}

impl Drop for RelayEthernet {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl DirectEthernet for RelayEthernet {
    async fn context(&self) -> FpgaResult<ContextId> {
        Ok(self.table.allocate())
    }

    async fn send(&self, ctx: ContextId, packet: EthernetPacket) -> FpgaResult<EthernetReply> {
        if !self.is_connected() {
            return Err(FpgaError::Connection(format!(
                "frame relay at {} is gone",
                self.address
            )));
        }
        self.table.execute(&self.sink, self.host_mac, ctx, packet).await
    }

    async fn expire(&self, ctx: ContextId) -> FpgaResult<()> {
        self.table.expire(ctx);
        Ok(())
    }

    fn host_mac(&self) -> MacAddress {
        self.host_mac
    }
}
