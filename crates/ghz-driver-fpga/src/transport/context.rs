//! Per-context filter and receive-queue bookkeeping shared by the adapters.

use super::{ContextId, EthernetOp, EthernetPacket, EthernetReply, Frame};
use async_trait::async_trait;
use ghz_core::{FpgaError, FpgaResult, MacAddress};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout_at, Instant};

/// Read timeout of a fresh context.
pub const DEFAULT_CONTEXT_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound side of an adapter.
#[async_trait]
pub(crate) trait FrameSink: Send + Sync {
    fn has_port(&self, port: u32) -> bool;
    async fn transmit(&self, port: u32, frame: Frame) -> FpgaResult<()>;
}

#[derive(Debug)]
struct ContextState {
    port: Option<u32>,
    destination: Option<MacAddress>,
    source_filter: Option<MacAddress>,
    length_filter: Option<usize>,
    timeout: Duration,
    listening: bool,
    inbox: VecDeque<Frame>,
    notify: Arc<Notify>,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            port: None,
            destination: None,
            source_filter: None,
            length_filter: None,
            timeout: DEFAULT_CONTEXT_TIMEOUT,
            listening: false,
            inbox: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl ContextState {
    fn accepts(&self, port: u32, frame: &Frame) -> bool {
        self.listening
            && self.port == Some(port)
            && self.source_filter.map_or(true, |mac| mac == frame.source)
            && self.length_filter.map_or(true, |len| len == frame.payload.len())
    }

    fn target(&self, ctx: ContextId) -> String {
        match (self.source_filter, self.destination) {
            (Some(mac), _) | (None, Some(mac)) => mac.to_string(),
            (None, None) => ctx.to_string(),
        }
    }
}

enum Pending {
    Ready(Vec<Frame>),
    Waiting(Arc<Notify>, String),
}

/// Contexts of one direct-ethernet endpoint.
///
/// Incoming frames are delivered with [`ContextTable::dispatch`] to every
/// listening context whose filters match. Packet execution never holds the
/// table lock across an await point.
#[derive(Debug, Default)]
pub struct ContextTable {
    contexts: Mutex<HashMap<ContextId, ContextState>>,
    next_id: AtomicU64,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> ContextId {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.contexts.lock().insert(id, ContextState::default());
        id
    }

    pub fn expire(&self, ctx: ContextId) {
        self.contexts.lock().remove(&ctx);
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue an incoming frame on every matching context.
    pub fn dispatch(&self, port: u32, frame: Frame) -> usize {
        let mut contexts = self.contexts.lock();
        let mut delivered = 0;
        for state in contexts.values_mut().filter(|s| s.accepts(port, &frame)) {
            state.inbox.push_back(frame.clone());
            state.notify.notify_one();
            delivered += 1;
        }
        if delivered == 0 {
            tracing::trace!(%port, source = %frame.source, "frame dropped, no listener");
        }
        delivered
    }

    fn with_state<R>(
        &self,
        ctx: ContextId,
        f: impl FnOnce(&mut ContextState) -> FpgaResult<R>,
    ) -> FpgaResult<R> {
        let mut contexts = self.contexts.lock();
        let state = contexts
            .get_mut(&ctx)
            .ok_or_else(|| FpgaError::Connection(format!("unknown context {ctx}")))?;
        f(state)
    }

    /// Execute `packet` in order against `sink`.
    pub(crate) async fn execute(
        &self,
        sink: &dyn FrameSink,
        host: MacAddress,
        ctx: ContextId,
        packet: EthernetPacket,
    ) -> FpgaResult<EthernetReply> {
        let mut reply = EthernetReply::default();
        for op in packet.ops() {
            match op {
                EthernetOp::Connect(port) => {
                    if !sink.has_port(*port) {
                        return Err(FpgaError::Connection(format!(
                            "adapter port {port} does not exist"
                        )));
                    }
                    self.with_state(ctx, |s| {
                        s.port = Some(*port);
                        Ok(())
                    })?;
                }
                EthernetOp::DestinationMac(mac) => self.with_state(ctx, |s| {
                    s.destination = Some(*mac);
                    Ok(())
                })?,
                EthernetOp::RequireSourceMac(mac) => self.with_state(ctx, |s| {
                    s.source_filter = Some(*mac);
                    Ok(())
                })?,
                EthernetOp::RequireLength(len) => self.with_state(ctx, |s| {
                    s.length_filter = Some(*len);
                    Ok(())
                })?,
                EthernetOp::Timeout(timeout) => self.with_state(ctx, |s| {
                    s.timeout = *timeout;
                    Ok(())
                })?,
                EthernetOp::Listen => self.with_state(ctx, |s| {
                    s.listening = true;
                    Ok(())
                })?,
                EthernetOp::Clear => self.with_state(ctx, |s| {
                    s.inbox.clear();
                    Ok(())
                })?,
                EthernetOp::Write(payload) => {
                    let (port, destination) = self.with_state(ctx, |s| {
                        let port = s.port.ok_or_else(|| {
                            FpgaError::Connection(format!("{ctx} is not bound to a port"))
                        })?;
                        let destination = s.destination.ok_or_else(|| {
                            FpgaError::Protocol(format!("{ctx} has no destination MAC"))
                        })?;
                        Ok((port, destination))
                    })?;
                    let frame = Frame {
                        source: host,
                        destination,
                        payload: payload.clone(),
                    };
                    sink.transmit(port, frame).await?;
                }
                EthernetOp::Read(count) => reply.reads.push(self.wait(ctx, *count).await?),
                EthernetOp::Discard(count) => {
                    self.wait(ctx, *count).await?;
                }
                EthernetOp::Collect => reply.reads.push(self.collect(ctx).await?),
            }
        }
        Ok(reply)
    }

    /// Wait until `count` frames are queued and take them.
    async fn wait(&self, ctx: ContextId, count: usize) -> FpgaResult<Vec<Frame>> {
        let after = self.with_state(ctx, |s| Ok(s.timeout))?;
        let deadline = Instant::now() + after;
        loop {
            let pending = self.with_state(ctx, |s| {
                if s.inbox.len() >= count {
                    Ok(Pending::Ready(s.inbox.drain(..count).collect()))
                } else {
                    Ok(Pending::Waiting(Arc::clone(&s.notify), s.target(ctx)))
                }
            })?;
            match pending {
                Pending::Ready(frames) => return Ok(frames),
                Pending::Waiting(notify, target) => {
                    if timeout_at(deadline, notify.notified()).await.is_err() {
                        return Err(FpgaError::Timeout { target, after });
                    }
                }
            }
        }
    }

    /// Wait out the context timeout, then take everything queued.
    async fn collect(&self, ctx: ContextId) -> FpgaResult<Vec<Frame>> {
        let after = self.with_state(ctx, |s| Ok(s.timeout))?;
        sleep_until(Instant::now() + after).await;
        self.with_state(ctx, |s| Ok(s.inbox.drain(..).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        fn has_port(&self, port: u32) -> bool {
            port == 1
        }

        async fn transmit(&self, _port: u32, _frame: Frame) -> FpgaResult<()> {
            Ok(())
        }
    }

    fn frame(source: u8, len: usize) -> Frame {
        Frame {
            source: MacAddress::new([0, 1, 0xCA, 0xAA, 0, source]),
            destination: MacAddress::new([0; 6]),
            payload: Bytes::from(vec![0u8; len]),
        }
    }

    #[tokio::test]
    async fn test_filters_gate_delivery() {
        let table = ContextTable::new();
        let ctx = table.allocate();
        let setup = EthernetPacket::new()
            .connect(1)
            .require_source_mac(frame(3, 0).source)
            .require_length(70)
            .listen();
        table
            .execute(&NullSink, MacAddress::new([0; 6]), ctx, setup)
            .await
            .unwrap();

        assert_eq!(table.dispatch(1, frame(3, 70)), 1);
        assert_eq!(table.dispatch(1, frame(4, 70)), 0);
        assert_eq!(table.dispatch(1, frame(3, 56)), 0);
        assert_eq!(table.dispatch(2, frame(3, 70)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let table = ContextTable::new();
        let ctx = table.allocate();
        let packet = EthernetPacket::new()
            .connect(1)
            .timeout(Duration::from_millis(50))
            .listen()
            .read(1);
        let err = table
            .execute(&NullSink, MacAddress::new([0; 6]), ctx, packet)
            .await
            .unwrap_err();
        assert!(matches!(err, FpgaError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unknown_port_is_a_connection_error() {
        let table = ContextTable::new();
        let ctx = table.allocate();
        let err = table
            .execute(&NullSink, MacAddress::new([0; 6]), ctx, EthernetPacket::new().connect(9))
            .await
            .unwrap_err();
        assert!(matches!(err, FpgaError::Connection(_)));
    }

    #[tokio::test]
    async fn test_write_requires_destination() {
        let table = ContextTable::new();
        let ctx = table.allocate();
        let packet = EthernetPacket::new().connect(1).write(vec![1u8]);
        let err = table
            .execute(&NullSink, MacAddress::new([0; 6]), ctx, packet)
            .await
            .unwrap_err();
        assert!(matches!(err, FpgaError::Protocol(_)));
    }

    #[test]
    fn test_expire_is_idempotent() {
        let table = ContextTable::new();
        let ctx = table.allocate();
        assert_eq!(table.len(), 1);
        table.expire(ctx);
        table.expire(ctx);
        assert!(table.is_empty());
    }
}
