use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::binary::BinaryFormat;
use crate::envelope::{Envelope, WireFrame};

/// Process-unique identity of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound side of one connection
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()>;

    /// Connection this sink writes to; clones of a sink share it.
    fn connection_id(&self) -> ConnectionId;
}

/// In-memory sink handing envelopes to a channel, used to wire nodes together
/// in-process.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Envelope>,
    id: ConnectionId,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                id: ConnectionId::next(),
            },
            rx,
        )
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.tx
            .send(envelope)
            .map_err(|e| anyhow!("channel closed, dropping {}", e.0.kind()))
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }
}

/// Sink encoding envelopes into wire frames for a transport writer task.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<WireFrame>,
    format: BinaryFormat,
    id: ConnectionId,
}

impl FrameSink {
    pub fn new(format: BinaryFormat) -> (Self, mpsc::UnboundedReceiver<WireFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                format,
                id: ConnectionId::next(),
            },
            rx,
        )
    }
}

#[async_trait]
impl MessageSink for FrameSink {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        let frame = envelope.encode_with(self.format)?;
        self.tx
            .send(frame)
            .map_err(|_| anyhow!("connection closed"))
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }
}
