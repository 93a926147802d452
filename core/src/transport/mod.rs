//! Transport seam for the reader
//!
//! The protocol core only needs three things from the link layer: lifecycle
//! events (connect / disconnect), inbound frames, and a way to push a reply
//! frame back to the same peer. Everything else (GATT registration,
//! advertising, pairing) belongs to the platform stack.

pub mod gatt;
pub mod loopback;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gatt::{
    CharacteristicProperties, NotifyQueue, CREDENTIAL_SERVICE_UUID, DATA_TRANSFER_CHAR_UUID,
    MAX_CHARACTERISTIC_SIZE, READER_NAME,
};
pub use loopback::LoopbackTransport;

/// Opaque per-connection identifier assigned by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Errors for outbound delivery
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Notify queue full (backpressure)")]
    QueueFull,
    #[error("Frame of {0} bytes exceeds characteristic size")]
    FrameTooLarge(usize),
    #[error("Transport closed")]
    Closed,
}

/// Outbound half of the data channel.
///
/// `send` must not block: implementations queue the frame and deliver it as a
/// notification on their own schedule, preserving per-connection order.
pub trait ReaderTransport: Send + Sync {
    fn send(&self, connection: &ConnectionId, frame: &[u8]) -> Result<(), TransportError>;

    /// The link to `connection` is gone; release anything held for it.
    fn disconnect(&self, _connection: &ConnectionId) {}
}
