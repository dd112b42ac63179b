//! Transport abstraction (spec.md §9 design notes): the Session Manager
//! and Connection Handler never depend on WebSocket specifics. A
//! transport is modeled as a queued `send` sink plus `close`; the inbound
//! side is driven by whoever owns the connection (the Connection Handler
//! reading frames off an axum WebSocket, or a test harness reading off an
//! in-memory channel). This keeps the core testable with in-memory pipes.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;

pub trait Transport: Send + Sync {
    /// Enqueue a frame for delivery. An error return means the transport
    /// is considered failed (spec.md §4.3.2): the caller should treat the
    /// client as gone and invoke `remove_client_everywhere`.
    fn send(&self, frame: ServerMessage) -> Result<()>;

    fn close(&self);
}

/// In-memory transport backed by an unbounded channel, used by the core's
/// own unit tests and available to any test harness that wants to drive
/// the Session Manager without a real network connection.
pub struct ChannelTransport {
    tx: tokio::sync::mpsc::UnboundedSender<ServerMessage>,
    closed: std::sync::atomic::AtomicBool,
}

impl ChannelTransport {
    pub fn new() -> (std::sync::Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (std::sync::Arc::new(Self { tx, closed: std::sync::atomic::AtomicBool::new(false) }), rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: ServerMessage) -> Result<()> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(GatewayError::Internal("transport closed".into()));
        }
        self.tx
            .send(frame)
            .map_err(|_| GatewayError::Internal("transport receiver dropped".into()))
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
