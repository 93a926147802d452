// Reader-side protocol state machine
//
// handle_message runs to completion without awaiting anything. A CREDENTIAL
// that decrypts cleanly parks the session in PROCESSING and hands the payload
// back to the caller as a PendingCredential; the caller obtains a decision
// (possibly asynchronously) and closes the round with complete_credential.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, DeviceId, MasterKey, Nonce, NONCE_SIZE};
use crate::message::codec::{decode_auth_request, decode_credential};
use crate::message::{
    encode_credential_response, encode_error, parse_frame, AuthResponse, CredentialStatus,
    ErrorCode, MessageType,
};
use crate::session::{ConnectionState, SessionContext, SessionStore};
use crate::transport::ConnectionId;
use crate::ProtocolError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Failed CREDENTIAL decryptions tolerated per authenticated round.
    /// `None` allows unlimited retries.
    pub max_credential_attempts: Option<u32>,
}

/// What the caller must do after feeding a frame to the handler
#[derive(Debug)]
#[must_use = "a reply must be sent or a pending credential completed"]
pub enum HandleOutcome {
    /// Send this frame back to the peer
    Reply(Vec<u8>),
    /// Obtain a validation decision, then call [`ProtocolHandler::complete_credential`].
    ///
    /// The session stays `PROCESSING` until that call. Dropping the pending
    /// credential instead leaves the connection refusing every message until
    /// it disconnects.
    Validate(PendingCredential),
}

/// A decrypted credential awaiting a decision
pub struct PendingCredential {
    pub connection: ConnectionId,
    pub device_id: DeviceId,
    pub payload: Zeroizing<Vec<u8>>,
    ticket: u64,
}

impl fmt::Debug for PendingCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCredential")
            .field("connection", &self.connection)
            .field("device_id", &self.device_id)
            .field("payload_len", &self.payload.len())
            .field("ticket", &self.ticket)
            .finish()
    }
}

pub struct ProtocolHandler {
    master_key: MasterKey,
    sessions: Arc<SessionStore>,
    config: HandlerConfig,
    next_ticket: AtomicU64,
}

impl ProtocolHandler {
    pub fn new(master_key: MasterKey) -> Self {
        Self::with_config(master_key, HandlerConfig::default())
    }

    pub fn with_config(master_key: MasterKey, config: HandlerConfig) -> Self {
        info!(
            fingerprint = %master_key.fingerprint(),
            max_credential_attempts = ?config.max_credential_attempts,
            "Protocol handler ready"
        );
        Self {
            master_key,
            sessions: Arc::new(SessionStore::new()),
            config,
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Build a handler from raw master key bytes; refuses anything but 16 bytes.
    pub fn from_key_bytes(master_key: &[u8]) -> Result<Self, ProtocolError> {
        let key = MasterKey::from_slice(master_key).map_err(ProtocolError::Config)?;
        Ok(Self::new(key))
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn state(&self, connection: &ConnectionId) -> Option<ConnectionState> {
        self.sessions.state(connection)
    }

    pub fn on_connect(&self, connection: &ConnectionId) {
        self.sessions.connect(connection);
        info!(%connection, "Client connected, state: CONNECTED");
    }

    pub fn on_disconnect(&self, connection: &ConnectionId) -> bool {
        let removed = self.sessions.remove(connection);
        info!(%connection, "Client disconnected, session cleared");
        removed
    }

    /// Process one inbound frame. Never panics on malformed input; every
    /// rejection becomes an ERROR reply and the session stays usable.
    pub fn handle_message(&self, connection: &ConnectionId, data: &[u8]) -> HandleOutcome {
        let (message_type, body) = match parse_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%connection, error = %e, "Invalid message");
                return HandleOutcome::Reply(encode_error(ErrorCode::InvalidMessage));
            }
        };

        let result = self.sessions.with_session(connection, |session| {
            info!(
                %connection,
                message = %message_type,
                state = %session.state,
                "Received message"
            );
            match message_type {
                MessageType::AuthRequest => self
                    .handle_auth_request(connection, session, body)
                    .map(HandleOutcome::Reply),
                MessageType::Credential => self.handle_credential(connection, session, body),
                other => {
                    warn!(%connection, message = %other, "Unexpected message type from peer");
                    Err(ProtocolError::InvalidState)
                }
            }
        });

        result.unwrap_or_else(|err| HandleOutcome::Reply(encode_error(err.error_code())))
    }

    /// Close a round opened by [`HandleOutcome::Validate`].
    ///
    /// Returns the CREDENTIAL_RESPONSE frame, or `None` when the session was
    /// disconnected or restarted while the decision was outstanding.
    pub fn complete_credential(
        &self,
        pending: &PendingCredential,
        status: CredentialStatus,
    ) -> Option<Vec<u8>> {
        let frame = self
            .sessions
            .with_existing(&pending.connection, |session| {
                if session.state != ConnectionState::Processing
                    || session.pending_ticket != Some(pending.ticket)
                {
                    return None;
                }
                session.pending_ticket = None;
                session.state = ConnectionState::Complete;
                Some(encode_credential_response(status))
            })
            .flatten();

        match frame {
            Some(_) => info!(
                connection = %pending.connection,
                %status,
                "Credential processing complete"
            ),
            None => debug!(
                connection = %pending.connection,
                "Dropping decision for a session that moved on"
            ),
        }
        frame
    }

    /// Synchronous convenience: handle a frame and, if it carries a credential,
    /// decide it inline with `validate`.
    pub fn process(
        &self,
        connection: &ConnectionId,
        data: &[u8],
        validate: impl FnOnce(&[u8], &DeviceId) -> CredentialStatus,
    ) -> Vec<u8> {
        match self.handle_message(connection, data) {
            HandleOutcome::Reply(frame) => frame,
            HandleOutcome::Validate(pending) => {
                let status = validate(&pending.payload, &pending.device_id);
                self.complete_credential(&pending, status)
                    .unwrap_or_else(|| encode_error(ErrorCode::InvalidState))
            }
        }
    }

    fn handle_auth_request(
        &self,
        connection: &ConnectionId,
        session: &mut SessionContext,
        body: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        // Transports that cannot tell physical connections apart reuse one
        // identifier; a fresh AUTH_REQUEST after COMPLETE starts over.
        if session.state.accepts_restart() {
            info!(%connection, state = %session.state, "AUTH_REQUEST restarts session");
            session.reset();
        } else if session.state != ConnectionState::Connected {
            warn!(%connection, state = %session.state, "AUTH_REQUEST in invalid state");
            return Err(ProtocolError::InvalidState);
        }

        let request = decode_auth_request(body).map_err(|e| {
            warn!(%connection, error = %e, "Failed to parse AUTH_REQUEST");
            ProtocolError::InvalidMessage
        })?;

        session.state = ConnectionState::Authenticating;
        info!(%connection, device_id = %request.device_id, "Processing AUTH_REQUEST");

        let device_key = match self.master_key.derive(&request.device_id) {
            Ok(key) => key,
            Err(e) => {
                warn!(%connection, error = %e, "Key derivation failed");
                session.state = ConnectionState::Connected;
                return Err(ProtocolError::UnknownDevice);
            }
        };

        let nonce_mobile = crypto::decrypt(
            device_key.as_bytes(),
            &request.iv,
            &request.encrypted_nonce,
        )
        .ok()
        .map(Zeroizing::new)
        .and_then(|plain| Nonce::try_from(plain.as_slice()).ok());

        let Some(nonce_mobile) = nonce_mobile else {
            warn!(%connection, device_id = %request.device_id, "Mobile nonce failed to decrypt");
            session.state = ConnectionState::Connected;
            return Err(ProtocolError::DecryptionFailed);
        };

        let nonce_reader = crypto::generate_nonce();
        let mut combined = Zeroizing::new([0u8; 2 * NONCE_SIZE]);
        combined[..NONCE_SIZE].copy_from_slice(&nonce_mobile);
        combined[NONCE_SIZE..].copy_from_slice(&nonce_reader);

        let (iv, encrypted_nonces) =
            match crypto::encrypt(device_key.as_bytes(), combined.as_slice(), None) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(%connection, error = %e, "Failed to seal nonces");
                    session.state = ConnectionState::Connected;
                    return Err(ProtocolError::Config(e));
                }
            };

        session.device_id = Some(request.device_id);
        session.device_key = Some(device_key);
        session.nonce_mobile = Some(nonce_mobile);
        session.nonce_reader = Some(nonce_reader);
        session.credential_attempts = 0;
        session.state = ConnectionState::Authenticated;
        info!(%connection, device_id = %request.device_id, "Authentication successful, state: AUTHENTICATED");

        Ok(AuthResponse {
            iv,
            encrypted_nonces,
        }
        .encode())
    }

    fn handle_credential(
        &self,
        connection: &ConnectionId,
        session: &mut SessionContext,
        body: &[u8],
    ) -> Result<HandleOutcome, ProtocolError> {
        if session.state != ConnectionState::Authenticated {
            warn!(%connection, state = %session.state, "CREDENTIAL in invalid state");
            return Err(ProtocolError::InvalidState);
        }

        let credential = decode_credential(body).map_err(|e| {
            warn!(%connection, error = %e, "Failed to parse CREDENTIAL");
            ProtocolError::InvalidMessage
        })?;

        let (device_id, decrypted) = match (session.device_id, session.device_key.as_ref()) {
            (Some(id), Some(key)) => (
                id,
                crypto::decrypt(key.as_bytes(), &credential.iv, &credential.encrypted_payload),
            ),
            _ => {
                warn!(%connection, "No device key in session");
                return Err(ProtocolError::InvalidState);
            }
        };

        session.state = ConnectionState::Processing;

        match decrypted {
            Ok(payload) => {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                session.pending_ticket = Some(ticket);
                info!(%connection, %device_id, bytes = payload.len(), "Processing credential");
                Ok(HandleOutcome::Validate(PendingCredential {
                    connection: connection.clone(),
                    device_id,
                    payload: Zeroizing::new(payload),
                    ticket,
                }))
            }
            Err(_) => {
                session.credential_attempts += 1;
                let exhausted = self
                    .config
                    .max_credential_attempts
                    .is_some_and(|max| session.credential_attempts >= max);

                if exhausted {
                    warn!(
                        %connection,
                        attempts = session.credential_attempts,
                        "Credential attempts exhausted, session reset"
                    );
                    session.reset();
                    return Err(ProtocolError::AuthFailed);
                }

                warn!(
                    %connection,
                    attempts = session.credential_attempts,
                    "Credential decryption failed"
                );
                session.state = ConnectionState::Authenticated;
                Err(ProtocolError::DecryptionFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MobileSession;
    use crate::crypto::DeviceKey;
    use crate::message::{decode_message, Message};

    const MASTER_HEX: &str = "00112233445566778899aabbccddeeff";
    const DEVICE_HEX: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4";

    fn handler() -> ProtocolHandler {
        ProtocolHandler::new(MasterKey::from_hex(MASTER_HEX).unwrap())
    }

    fn mobile() -> MobileSession {
        let master = MasterKey::from_hex(MASTER_HEX).unwrap();
        let device_id = DeviceId::from_hex(DEVICE_HEX).unwrap();
        let key = master.derive(&device_id).unwrap();
        MobileSession::new(device_id, key)
    }

    fn accept(_: &[u8], _: &DeviceId) -> CredentialStatus {
        CredentialStatus::Success
    }

    /// CREDENTIAL whose ciphertext is not a whole number of blocks
    fn unaligned_credential() -> Vec<u8> {
        let mut frame = vec![0x03];
        frame.extend_from_slice(&[0u8; 16]);
        frame.extend_from_slice(&[0xAA; 17]);
        frame
    }

    fn error_of(frame: &[u8]) -> ErrorCode {
        match decode_message(frame).unwrap() {
            Message::Error(code) => code,
            other => panic!("expected ERROR, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_short_master_key() {
        assert!(matches!(
            ProtocolHandler::from_key_bytes(&[0u8; 8]),
            Err(ProtocolError::Config(_))
        ));
    }

    #[test]
    fn test_garbage_input_yields_invalid_message() {
        let h = handler();
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);

        assert_eq!(error_of(&h.process(&conn, &[], accept)), ErrorCode::InvalidMessage);
        assert_eq!(error_of(&h.process(&conn, &[0x42, 0, 0], accept)), ErrorCode::InvalidMessage);
        assert_eq!(error_of(&h.process(&conn, &[0x01, 0, 0], accept)), ErrorCode::InvalidMessage);
        assert_eq!(h.state(&conn), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_credential_before_auth_is_invalid_state() {
        let h = handler();
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);

        let m = mobile();
        let frame = m.credential(b"badge-1234").unwrap();
        assert_eq!(error_of(&h.process(&conn, &frame, accept)), ErrorCode::InvalidState);
        assert_eq!(h.state(&conn), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_outbound_only_types_are_invalid_state() {
        let h = handler();
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);

        assert_eq!(error_of(&h.process(&conn, &[0x04, 0x00], accept)), ErrorCode::InvalidState);
        assert_eq!(error_of(&h.process(&conn, &[0xFF, 0x01], accept)), ErrorCode::InvalidState);
    }

    #[test]
    fn test_full_round() {
        let h = handler();
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);
        let mut m = mobile();

        let response = h.process(&conn, &m.auth_request().unwrap(), accept);
        assert_eq!(response.len(), 65);
        m.verify_auth_response(&response).unwrap();
        assert_eq!(h.state(&conn), Some(ConnectionState::Authenticated));

        let mut seen = Vec::new();
        let reply = h.process(&conn, &m.credential(b"badge-1234").unwrap(), |payload, id| {
            seen.extend_from_slice(payload);
            assert_eq!(id.to_hex(), DEVICE_HEX);
            CredentialStatus::Expired
        });
        assert_eq!(seen, b"badge-1234");
        assert_eq!(reply, vec![0x04, 0x02]);
        assert_eq!(h.state(&conn), Some(ConnectionState::Complete));
    }

    #[test]
    fn test_wrong_device_key_fails_auth() {
        let h = handler();
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);

        let mut m = MobileSession::new(
            DeviceId::from_hex(DEVICE_HEX).unwrap(),
            DeviceKey::from_bytes([0x55; 16]),
        );
        let reply = h.process(&conn, &m.auth_request().unwrap(), accept);
        // Even when wrong-key padding happens to check out, the plaintext
        // cannot be exactly one nonce long.
        assert_eq!(error_of(&reply), ErrorCode::DecryptionFailed);
        assert_eq!(h.state(&conn), Some(ConnectionState::Connected));
        assert_eq!(h.sessions().with_existing(&conn, |s| s.has_key_material()), Some(false));
    }

    #[test]
    fn test_credential_retry_after_decrypt_failure() {
        let h = handler();
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);
        let mut m = mobile();
        h.process(&conn, &m.auth_request().unwrap(), accept);

        let reply = h.process(&conn, &unaligned_credential(), accept);
        assert_eq!(error_of(&reply), ErrorCode::DecryptionFailed);
        assert_eq!(h.state(&conn), Some(ConnectionState::Authenticated));

        let reply = h.process(&conn, &m.credential(b"badge").unwrap(), accept);
        assert_eq!(reply, vec![0x04, 0x00]);
    }

    #[test]
    fn test_attempt_cap_resets_session() {
        let h = ProtocolHandler::with_config(
            MasterKey::from_hex(MASTER_HEX).unwrap(),
            HandlerConfig {
                max_credential_attempts: Some(2),
            },
        );
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);
        let mut m = mobile();
        h.process(&conn, &m.auth_request().unwrap(), accept);

        let bad = unaligned_credential();

        let first = error_of(&h.process(&conn, &bad, accept));
        let second = error_of(&h.process(&conn, &bad, accept));
        assert_eq!(first, ErrorCode::DecryptionFailed);
        assert_eq!(second, ErrorCode::AuthFailed);
        assert_eq!(h.state(&conn), Some(ConnectionState::Connected));
        assert_eq!(h.sessions().with_existing(&conn, |s| s.has_key_material()), Some(false));
    }

    #[test]
    fn test_second_auth_request_while_authenticated_is_rejected() {
        let h = handler();
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);
        let mut m = mobile();
        h.process(&conn, &m.auth_request().unwrap(), accept);

        let reply = h.process(&conn, &m.auth_request().unwrap(), accept);
        assert_eq!(error_of(&reply), ErrorCode::InvalidState);
        assert_eq!(h.state(&conn), Some(ConnectionState::Authenticated));
    }

    #[test]
    fn test_late_decision_after_disconnect_is_dropped() {
        let h = handler();
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);
        let mut m = mobile();
        h.process(&conn, &m.auth_request().unwrap(), accept);

        let pending = match h.handle_message(&conn, &m.credential(b"badge").unwrap()) {
            HandleOutcome::Validate(p) => p,
            other => panic!("expected Validate, got {:?}", other),
        };
        assert_eq!(h.state(&conn), Some(ConnectionState::Processing));

        // Messages during PROCESSING are refused
        match h.handle_message(&conn, &m.credential(b"again").unwrap()) {
            HandleOutcome::Reply(frame) => assert_eq!(error_of(&frame), ErrorCode::InvalidState),
            other => panic!("expected Reply, got {:?}", other),
        }

        h.on_disconnect(&conn);
        h.on_connect(&conn);
        assert!(h.complete_credential(&pending, CredentialStatus::Success).is_none());
        assert_eq!(h.state(&conn), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_abandoned_decision_holds_processing_until_disconnect() {
        let h = handler();
        let conn = ConnectionId::from("c");
        h.on_connect(&conn);
        let mut m = mobile();
        h.process(&conn, &m.auth_request().unwrap(), accept);

        match h.handle_message(&conn, &m.credential(b"badge").unwrap()) {
            HandleOutcome::Validate(pending) => drop(pending),
            other => panic!("expected Validate, got {:?}", other),
        }
        assert_eq!(h.state(&conn), Some(ConnectionState::Processing));
        let reply = h.process(&conn, &m.auth_request().unwrap(), accept);
        assert_eq!(error_of(&reply), ErrorCode::InvalidState);

        h.on_disconnect(&conn);
        h.on_connect(&conn);
        let mut fresh = mobile();
        let response = h.process(&conn, &fresh.auth_request().unwrap(), accept);
        assert!(fresh.verify_auth_response(&response).is_ok());
        assert_eq!(h.state(&conn), Some(ConnectionState::Authenticated));
    }
}
