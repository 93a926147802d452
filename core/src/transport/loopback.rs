//! In-process transport
//!
//! Queues outbound notifications per connection so tests and the CLI demo can
//! drive a reader without a radio.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::gatt::{NotifyQueue, DEFAULT_MAX_QUEUED_NOTIFICATIONS};
use super::{ConnectionId, ReaderTransport, TransportError};

pub struct LoopbackTransport {
    queues: Mutex<HashMap<ConnectionId, NotifyQueue>>,
    max_queued: usize,
    closed: Mutex<bool>,
    notify: Notify,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_QUEUED_NOTIFICATIONS)
    }

    /// Per-connection queue depth before `send` reports backpressure
    pub fn with_capacity(max_queued: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_queued,
            closed: Mutex::new(false),
            notify: Notify::new(),
        }
    }

    /// Pop the oldest frame delivered to `connection`
    pub fn take(&self, connection: &ConnectionId) -> Option<Vec<u8>> {
        self.queues
            .lock()
            .get_mut(connection)
            .and_then(|queue| queue.dequeue())
    }

    /// Wait for the next frame delivered to `connection`
    pub async fn recv(&self, connection: &ConnectionId) -> Option<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.take(connection) {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn pending(&self, connection: &ConnectionId) -> usize {
        self.queues.lock().get(connection).map_or(0, |q| q.len())
    }

    pub fn close(&self) {
        *self.closed.lock() = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderTransport for LoopbackTransport {
    fn send(&self, connection: &ConnectionId, frame: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        {
            let mut queues = self.queues.lock();
            queues
                .entry(connection.clone())
                .or_insert_with(|| NotifyQueue::new(self.max_queued))
                .enqueue(frame.to_vec())?;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn disconnect(&self, connection: &ConnectionId) {
        self.queues.lock().remove(connection);
    }
}
