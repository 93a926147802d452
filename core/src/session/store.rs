// Session store: exclusive owner of every SessionContext
//
// All lookups and mutations go through one mutex, so a multi-threaded
// transport can deliver callbacks from any thread.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::state::{ConnectionState, SessionContext};
use crate::transport::ConnectionId;

/// Session lifecycle counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub sessions_active: usize,
    pub sessions_created: u64,
    pub sessions_closed: u64,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<ConnectionId, SessionContext>>,
    stats: Mutex<SessionStats>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport connect event: start a fresh CONNECTED session, discarding
    /// anything left over under the same identifier.
    pub fn connect(&self, connection: &ConnectionId) {
        let mut sessions = self.sessions.lock();
        let replaced = sessions
            .insert(connection.clone(), SessionContext::connected())
            .is_some();

        let mut stats = self.stats.lock();
        if !replaced {
            stats.sessions_created += 1;
        }
        stats.sessions_active = sessions.len();
    }

    /// First contact without an explicit connect event: create the session
    /// and move it out of IDLE. Returns `true` if a transition happened.
    pub fn ensure_connected(&self, connection: &ConnectionId) -> bool {
        let mut sessions = self.sessions.lock();
        let mut created = false;
        let session = sessions.entry(connection.clone()).or_insert_with(|| {
            created = true;
            SessionContext::default()
        });

        let transitioned = session.state == ConnectionState::Idle;
        if transitioned {
            session.state = ConnectionState::Connected;
        }

        if created {
            let mut stats = self.stats.lock();
            stats.sessions_created += 1;
            stats.sessions_active = sessions.len();
        }
        transitioned
    }

    /// Run `f` against the session for `connection`, creating an IDLE one on
    /// first contact.
    pub fn with_session<R>(
        &self,
        connection: &ConnectionId,
        f: impl FnOnce(&mut SessionContext) -> R,
    ) -> R {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        let session = sessions.entry(connection.clone()).or_default();
        let result = f(session);

        if sessions.len() != before {
            let mut stats = self.stats.lock();
            stats.sessions_created += 1;
            stats.sessions_active = sessions.len();
        }
        result
    }

    /// Run `f` only if a session already exists.
    pub fn with_existing<R>(
        &self,
        connection: &ConnectionId,
        f: impl FnOnce(&mut SessionContext) -> R,
    ) -> Option<R> {
        self.sessions.lock().get_mut(connection).map(f)
    }

    /// Transport disconnect event: destroy the whole record.
    pub fn remove(&self, connection: &ConnectionId) -> bool {
        let mut sessions = self.sessions.lock();
        let removed = sessions.remove(connection).is_some();
        if removed {
            let mut stats = self.stats.lock();
            stats.sessions_closed += 1;
            stats.sessions_active = sessions.len();
        }
        removed
    }

    pub fn state(&self, connection: &ConnectionId) -> Option<ConnectionState> {
        self.sessions.lock().get(connection).map(|s| s.state)
    }

    pub fn contains(&self, connection: &ConnectionId) -> bool {
        self.sessions.lock().contains_key(connection)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Drop every session (service shutdown)
    pub fn clear(&self) {
        let mut sessions = self.sessions.lock();
        let closed = sessions.len() as u64;
        sessions.clear();

        let mut stats = self.stats.lock();
        stats.sessions_closed += closed;
        stats.sessions_active = 0;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }
}
