//! Mobile side of the reader protocol
//!
//! Builds the frames a handset sends and checks what the reader sends back.
//! Used by the CLI demo and the integration tests; a real handset app links
//! the same logic.

use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, CryptoError, DeviceId, DeviceKey, MasterKey, Nonce, NONCE_SIZE};
use crate::message::{
    decode_message, AuthRequest, CodecError, Credential, CredentialStatus, ErrorCode, Message,
    MessageType,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Malformed reply: {0}")]
    Codec(#[from] CodecError),
    #[error("Reader error: {} ({})", .0.name(), .0.describe())]
    Reader(ErrorCode),
    #[error("Unexpected {0} from reader")]
    UnexpectedMessage(MessageType),
    #[error("No AUTH_REQUEST outstanding")]
    NoChallenge,
    #[error("Nonce payload has {0} bytes, expected 32")]
    NoncePayloadLength(usize),
    #[error("Reader echoed the wrong nonce")]
    NonceMismatch,
}

pub struct MobileSession {
    device_id: DeviceId,
    device_key: DeviceKey,
    nonce_mobile: Option<Nonce>,
    nonce_reader: Option<Nonce>,
}

impl MobileSession {
    pub fn new(device_id: DeviceId, device_key: DeviceKey) -> Self {
        Self {
            device_id,
            device_key,
            nonce_mobile: None,
            nonce_reader: None,
        }
    }

    /// Enrolment shortcut: derive the device key the reader will expect.
    pub fn enrol(master_key: &MasterKey, device_id: DeviceId) -> Result<Self, CryptoError> {
        let device_key = master_key.derive(&device_id)?;
        Ok(Self::new(device_id, device_key))
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.nonce_reader.is_some()
    }

    /// Reader's challenge nonce, once the handshake has completed
    pub fn nonce_reader(&self) -> Option<&Nonce> {
        self.nonce_reader.as_ref()
    }

    /// Start a handshake: fresh NonceMobile, encrypted under the device key.
    pub fn auth_request(&mut self) -> Result<Vec<u8>, ClientError> {
        self.forget_nonces();
        let nonce = crypto::generate_nonce();
        let (iv, encrypted_nonce) = crypto::encrypt(self.device_key.as_bytes(), &nonce, None)?;
        self.nonce_mobile = Some(nonce);

        debug!(device_id = %self.device_id, "Built AUTH_REQUEST");
        Ok(AuthRequest {
            device_id: self.device_id,
            iv,
            encrypted_nonce,
        }
        .encode())
    }

    /// Check the reader's AUTH_RESPONSE and return its NonceReader.
    ///
    /// The reader proves it knows the device key by echoing our nonce.
    pub fn verify_auth_response(&mut self, frame: &[u8]) -> Result<Nonce, ClientError> {
        let expected = self.nonce_mobile.ok_or(ClientError::NoChallenge)?;

        let response = match decode_message(frame)? {
            Message::AuthResponse(response) => response,
            Message::Error(code) => return Err(ClientError::Reader(code)),
            other => return Err(ClientError::UnexpectedMessage(other.message_type())),
        };

        let plain = Zeroizing::new(crypto::decrypt(
            self.device_key.as_bytes(),
            &response.iv,
            &response.encrypted_nonces,
        )?);
        if plain.len() != 2 * NONCE_SIZE {
            return Err(ClientError::NoncePayloadLength(plain.len()));
        }
        if !bool::from(plain[..NONCE_SIZE].ct_eq(&expected)) {
            return Err(ClientError::NonceMismatch);
        }

        let mut nonce_reader = [0u8; NONCE_SIZE];
        nonce_reader.copy_from_slice(&plain[NONCE_SIZE..]);
        self.nonce_reader = Some(nonce_reader);
        debug!(device_id = %self.device_id, "Reader authenticated");
        Ok(nonce_reader)
    }

    /// CREDENTIAL frame carrying `payload` under the device key
    pub fn credential(&self, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let (iv, encrypted_payload) = crypto::encrypt(self.device_key.as_bytes(), payload, None)?;
        Ok(Credential {
            iv,
            encrypted_payload,
        }
        .encode())
    }

    /// Interpret the reader's answer to a CREDENTIAL frame
    pub fn parse_credential_response(frame: &[u8]) -> Result<CredentialStatus, ClientError> {
        match decode_message(frame)? {
            Message::CredentialResponse(status) => Ok(status),
            Message::Error(code) => Err(ClientError::Reader(code)),
            other => Err(ClientError::UnexpectedMessage(other.message_type())),
        }
    }

    fn forget_nonces(&mut self) {
        if let Some(nonce) = self.nonce_mobile.as_mut() {
            nonce.zeroize();
        }
        if let Some(nonce) = self.nonce_reader.as_mut() {
            nonce.zeroize();
        }
        self.nonce_mobile = None;
        self.nonce_reader = None;
    }
}

impl Drop for MobileSession {
    fn drop(&mut self) {
        self.forget_nonces();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{encode_credential_response, encode_error, AuthResponse};

    fn session() -> MobileSession {
        MobileSession::new(DeviceId::new([0x11; 16]), DeviceKey::from_bytes([0x22; 16]))
    }

    /// Reader side of the handshake, done by hand
    fn reply_to(request: &[u8], key: &[u8; 16], echo_ok: bool) -> Vec<u8> {
        let iv = &request[17..33];
        let mut nonce = crypto::decrypt(key, iv, &request[33..]).unwrap();
        if !echo_ok {
            nonce[0] ^= 0xFF;
        }
        nonce.extend_from_slice(&[0x5A; 16]);
        let (iv, encrypted_nonces) = crypto::encrypt(key, &nonce, None).unwrap();
        AuthResponse {
            iv,
            encrypted_nonces,
        }
        .encode()
    }

    #[test]
    fn test_auth_request_layout() {
        let mut m = session();
        let frame = m.auth_request().unwrap();

        assert_eq!(frame[0], 0x01);
        assert_eq!(&frame[1..17], &[0x11; 16]);
        assert_eq!(frame.len(), 65);
    }

    #[test]
    fn test_verify_accepts_echoed_nonce() {
        let mut m = session();
        let request = m.auth_request().unwrap();

        let nonce_reader = m
            .verify_auth_response(&reply_to(&request, &[0x22; 16], true))
            .unwrap();
        assert_eq!(nonce_reader, [0x5A; 16]);
        assert!(m.is_authenticated());
    }

    #[test]
    fn test_verify_rejects_wrong_echo() {
        let mut m = session();
        let request = m.auth_request().unwrap();

        let result = m.verify_auth_response(&reply_to(&request, &[0x22; 16], false));
        assert_eq!(result, Err(ClientError::NonceMismatch));
        assert!(!m.is_authenticated());
    }

    #[test]
    fn test_verify_without_challenge() {
        let mut m = session();
        assert_eq!(
            m.verify_auth_response(&encode_error(ErrorCode::Timeout)),
            Err(ClientError::NoChallenge)
        );
    }

    #[test]
    fn test_reader_errors_surface() {
        let mut m = session();
        m.auth_request().unwrap();
        assert_eq!(
            m.verify_auth_response(&encode_error(ErrorCode::UnknownDevice)),
            Err(ClientError::Reader(ErrorCode::UnknownDevice))
        );
        assert_eq!(
            MobileSession::parse_credential_response(&encode_error(ErrorCode::InvalidState)),
            Err(ClientError::Reader(ErrorCode::InvalidState))
        );
    }

    #[test]
    fn test_parse_credential_response() {
        for status in CredentialStatus::ALL {
            assert_eq!(
                MobileSession::parse_credential_response(&encode_credential_response(status)),
                Ok(status)
            );
        }
        assert!(matches!(
            MobileSession::parse_credential_response(&[0x04, 0x09]),
            Err(ClientError::Codec(_))
        ));
    }

    #[test]
    fn test_reader_error_message_is_readable() {
        let err = ClientError::Reader(ErrorCode::Timeout);
        assert_eq!(err.to_string(), "Reader error: TIMEOUT (Reader timeout)");
    }
}
