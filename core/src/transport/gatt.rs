//! GATT profile for the credential reader
//!
//! The reader exposes one service with one data characteristic. The handset
//! writes protocol frames with Write Without Response; the reader answers with
//! notifications on the same characteristic. Registration and advertising are
//! left to the platform BLE stack; this module only carries the identifiers and
//! the bounded notify queue shared by transport implementations.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::TransportError;

/// Credential service UUID
pub const CREDENTIAL_SERVICE_UUID: &str = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";

/// Data transfer characteristic UUID (write-without-response + notify)
pub const DATA_TRANSFER_CHAR_UUID: &str = "b2c3d4e5-f678-90ab-cdef-234567890abc";

/// Advertised local name
pub const READER_NAME: &str = "CRED-READER";

/// Maximum GATT characteristic value size (protocol limitation)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// Default maximum queued notifications before backpressure
pub const DEFAULT_MAX_QUEUED_NOTIFICATIONS: usize = 10;

/// Characteristic properties advertised for the data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub write_without_response: bool,
    pub notify: bool,
    pub read: bool,
}

impl CharacteristicProperties {
    /// Properties of [`DATA_TRANSFER_CHAR_UUID`]
    pub fn data_transfer() -> Self {
        Self {
            write_without_response: true,
            notify: true,
            read: false,
        }
    }
}

/// Bounded FIFO of outbound notifications for one connection
#[derive(Debug)]
pub struct NotifyQueue {
    queue: VecDeque<Vec<u8>>,
    max_queued: usize,
}

impl NotifyQueue {
    pub fn new(max_queued: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_queued,
        }
    }

    pub fn new_default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED_NOTIFICATIONS)
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_queued
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Queue a frame; refuses oversized values and applies backpressure.
    pub fn enqueue(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.len() > MAX_CHARACTERISTIC_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        if self.is_full() {
            return Err(TransportError::QueueFull);
        }
        self.queue.push_back(frame);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for NotifyQueue {
    fn default() -> Self {
        Self::new_default()
    }
}
