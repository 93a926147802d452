// Per-connection session record and its lifecycle states
//
// IDLE -> CONNECTED -> AUTHENTICATING -> AUTHENTICATED -> PROCESSING -> COMPLETE

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{DeviceId, DeviceKey, Nonce};

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connected,
    Authenticating,
    Authenticated,
    Processing,
    Complete,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::Authenticated => "AUTHENTICATED",
            ConnectionState::Processing => "PROCESSING",
            ConnectionState::Complete => "COMPLETE",
        }
    }

    /// States in which a new AUTH_REQUEST silently restarts the session
    pub fn accepts_restart(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Complete)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mutable per-connection record, owned by the [`SessionStore`](super::SessionStore).
#[derive(Default)]
pub struct SessionContext {
    pub state: ConnectionState,
    pub device_id: Option<DeviceId>,
    pub device_key: Option<DeviceKey>,
    pub nonce_mobile: Option<Nonce>,
    pub nonce_reader: Option<Nonce>,
    /// Failed CREDENTIAL decryptions since the last successful AUTH_REQUEST
    pub credential_attempts: u32,
    /// Ticket of the credential decision currently outstanding, if any
    pub pending_ticket: Option<u64>,
}

impl SessionContext {
    pub fn connected() -> Self {
        let mut session = Self::default();
        session.state = ConnectionState::Connected;
        session
    }

    /// Erase all cryptographic material and per-round counters.
    pub fn clear_crypto(&mut self) {
        self.device_id = None;
        // DeviceKey wipes itself on drop
        self.device_key = None;
        if let Some(nonce) = self.nonce_mobile.as_mut() {
            nonce.zeroize();
        }
        if let Some(nonce) = self.nonce_reader.as_mut() {
            nonce.zeroize();
        }
        self.nonce_mobile = None;
        self.nonce_reader = None;
        self.credential_attempts = 0;
        self.pending_ticket = None;
    }

    /// Return to a fresh CONNECTED session for a new authentication round.
    pub fn reset(&mut self) {
        self.clear_crypto();
        self.state = ConnectionState::Connected;
    }

    pub fn has_key_material(&self) -> bool {
        self.device_key.is_some()
            || self.nonce_mobile.is_some()
            || self.nonce_reader.is_some()
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.clear_crypto();
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("state", &self.state)
            .field("device_id", &self.device_id)
            .field("has_key", &self.device_key.is_some())
            .field("credential_attempts", &self.credential_attempts)
            .finish()
    }
}
