//! Transport Adapter
//!
//! Per-client outbound handle. Each WebSocket connection gets a bounded
//! channel drained by its own sender task; everything the server emits goes
//! through an [`Outbox`] so per-tick work never blocks on socket I/O. A
//! closed outbox means the connection is gone — the caller treats that as a
//! disconnect. A full outbox drops the frame for that client only (they
//! resynchronise through the reconnect path if they fall too far behind).

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::protocol::ServerMessage;

/// Default frames buffered per client before drops start.
pub const OUTBOX_CAPACITY: usize = 64;

/// The connection behind an outbox is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("client connection closed")]
pub struct OutboxClosed;

/// Handle for emitting events to one client.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
}

impl Outbox {
    /// Create an outbox and the receiver its sender task drains.
    pub fn channel() -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        (Self { tx }, rx)
    }

    /// Enqueue a frame without blocking.
    ///
    /// A full queue drops the frame (logged); only a closed connection is an
    /// error.
    pub fn emit(&self, message: ServerMessage) -> Result<(), OutboxClosed> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("client outbox full; frame dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(OutboxClosed),
        }
    }

    /// Whether the connection side has hung up.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
