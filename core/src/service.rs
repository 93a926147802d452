//! Reader service: wires transport callbacks to the protocol handler
//!
//! Transport callbacks run synchronously. Replies that need no decision are
//! pushed straight back through the transport; credential decisions run in
//! spawned tasks so one slow validator never stalls other connections.
//! Must be driven from inside a tokio runtime.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{HandleOutcome, PendingCredential, ProtocolHandler};
use crate::session::SessionStats;
use crate::transport::{ConnectionId, ReaderTransport};
use crate::validation::ValidationDelegate;

pub struct ReaderService {
    handler: Arc<ProtocolHandler>,
    delegate: Arc<ValidationDelegate>,
    transport: Arc<dyn ReaderTransport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReaderService {
    pub fn new(
        handler: Arc<ProtocolHandler>,
        delegate: Arc<ValidationDelegate>,
        transport: Arc<dyn ReaderTransport>,
    ) -> Self {
        Self {
            handler,
            delegate,
            transport,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn handler(&self) -> &Arc<ProtocolHandler> {
        &self.handler
    }

    pub fn delegate(&self) -> &Arc<ValidationDelegate> {
        &self.delegate
    }

    pub fn stats(&self) -> SessionStats {
        self.handler.sessions().stats()
    }

    pub fn on_connect(&self, connection: &ConnectionId) {
        self.handler.on_connect(connection);
    }

    pub fn on_disconnect(&self, connection: &ConnectionId) {
        self.handler.on_disconnect(connection);
        self.transport.disconnect(connection);
    }

    /// One inbound write on the data characteristic
    pub fn on_receive(&self, connection: &ConnectionId, data: &[u8]) {
        if self.handler.sessions().ensure_connected(connection) {
            info!(%connection, "Data from unannounced connection, state: CONNECTED");
        }
        debug!(%connection, bytes = data.len(), "Inbound frame");

        match self.handler.handle_message(connection, data) {
            HandleOutcome::Reply(frame) => deliver(self.transport.as_ref(), connection, &frame),
            HandleOutcome::Validate(pending) => self.spawn_decision(pending),
        }
    }

    /// Validation tasks still running
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.len()
    }

    /// Wait for every outstanding decision to be answered (or dropped).
    pub async fn drain(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "Validation task panicked");
                }
            }
        }
    }

    /// Cancel pending validations and drop every session.
    pub fn shutdown(&self) {
        self.delegate.cancel_all();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let aborted = tasks.len();
        for task in tasks {
            task.abort();
        }
        self.handler.sessions().clear();
        info!(aborted, "Reader service stopped");
    }

    fn spawn_decision(&self, pending: PendingCredential) {
        let handler = self.handler.clone();
        let delegate = self.delegate.clone();
        let transport = self.transport.clone();

        let task = tokio::spawn(async move {
            let status = delegate
                .validate(&pending.payload, &pending.device_id)
                .await;
            if let Some(frame) = handler.complete_credential(&pending, status) {
                deliver(transport.as_ref(), &pending.connection, &frame);
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

impl Drop for ReaderService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn deliver(transport: &dyn ReaderTransport, connection: &ConnectionId, frame: &[u8]) {
    if let Err(e) = transport.send(connection, frame) {
        warn!(%connection, error = %e, "Failed to send reply");
    }
}
