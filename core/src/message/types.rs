// Wire-level enums and message bodies for the reader protocol

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::{DeviceId, Iv};

/// One-byte message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    AuthRequest = 0x01,
    AuthResponse = 0x02,
    Credential = 0x03,
    CredentialResponse = 0x04,
    Error = 0xFF,
}

impl MessageType {
    pub fn from_byte(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(MessageType::AuthRequest),
            0x02 => Some(MessageType::AuthResponse),
            0x03 => Some(MessageType::Credential),
            0x04 => Some(MessageType::CredentialResponse),
            0xFF => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::AuthRequest => "AUTH_REQUEST",
            MessageType::AuthResponse => "AUTH_RESPONSE",
            MessageType::Credential => "CREDENTIAL",
            MessageType::CredentialResponse => "CREDENTIAL_RESPONSE",
            MessageType::Error => "ERROR",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of credential validation, carried in CREDENTIAL_RESPONSE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CredentialStatus {
    Success = 0x00,
    Rejected = 0x01,
    Expired = 0x02,
    Revoked = 0x03,
    InvalidFormat = 0x04,
}

impl CredentialStatus {
    pub const ALL: [CredentialStatus; 5] = [
        CredentialStatus::Success,
        CredentialStatus::Rejected,
        CredentialStatus::Expired,
        CredentialStatus::Revoked,
        CredentialStatus::InvalidFormat,
    ];

    pub fn from_byte(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as u8 == code)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CredentialStatus::Success => "SUCCESS",
            CredentialStatus::Rejected => "REJECTED",
            CredentialStatus::Expired => "EXPIRED",
            CredentialStatus::Revoked => "REVOKED",
            CredentialStatus::InvalidFormat => "INVALID_FORMAT",
        }
    }

    /// User-facing text shown on the handset
    pub fn describe(self) -> &'static str {
        match self {
            CredentialStatus::Success => "Access granted",
            CredentialStatus::Rejected => "Access denied",
            CredentialStatus::Expired => "Credential expired",
            CredentialStatus::Revoked => "Credential revoked",
            CredentialStatus::InvalidFormat => "Invalid credential",
        }
    }

    pub fn is_success(self) -> bool {
        self == CredentialStatus::Success
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CredentialStatus {
    type Err = UnknownStatus;

    /// Case-insensitive match on the status name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownStatus(wanted.to_string()))
    }
}

/// Status name that is not one of the five known values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown credential status: {0}")]
pub struct UnknownStatus(pub String);

/// Error codes carried in ERROR frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    InvalidMessage = 0x01,
    UnknownDevice = 0x02,
    DecryptionFailed = 0x03,
    InvalidState = 0x04,
    AuthFailed = 0x05,
    Timeout = 0x06,
}

impl ErrorCode {
    pub fn from_byte(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ErrorCode::InvalidMessage),
            0x02 => Some(ErrorCode::UnknownDevice),
            0x03 => Some(ErrorCode::DecryptionFailed),
            0x04 => Some(ErrorCode::InvalidState),
            0x05 => Some(ErrorCode::AuthFailed),
            0x06 => Some(ErrorCode::Timeout),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::UnknownDevice => "UNKNOWN_DEVICE",
            ErrorCode::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
        }
    }

    /// User-facing text shown on the handset
    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "Communication error",
            ErrorCode::UnknownDevice => "Device not recognized",
            ErrorCode::DecryptionFailed => "Authentication failed",
            ErrorCode::InvalidState => "Protocol error",
            ErrorCode::AuthFailed => "Authentication failed",
            ErrorCode::Timeout => "Reader timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// AUTH_REQUEST: `[0x01][DeviceId 16][IV 16][Enc(NonceMobile)]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub device_id: DeviceId,
    pub iv: Iv,
    pub encrypted_nonce: Vec<u8>,
}

/// AUTH_RESPONSE: `[0x02][IV 16][Enc(NonceMobile || NonceReader) 48]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub iv: Iv,
    pub encrypted_nonces: Vec<u8>,
}

/// CREDENTIAL: `[0x03][IV 16][Enc(payload)]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub iv: Iv,
    pub encrypted_payload: Vec<u8>,
}

/// A decoded protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AuthRequest(AuthRequest),
    AuthResponse(AuthResponse),
    Credential(Credential),
    CredentialResponse(CredentialStatus),
    Error(ErrorCode),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::AuthRequest(_) => MessageType::AuthRequest,
            Message::AuthResponse(_) => MessageType::AuthResponse,
            Message::Credential(_) => MessageType::Credential,
            Message::CredentialResponse(_) => MessageType::CredentialResponse,
            Message::Error(_) => MessageType::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_tags() {
        for (tag, ty) in [
            (0x01, MessageType::AuthRequest),
            (0x02, MessageType::AuthResponse),
            (0x03, MessageType::Credential),
            (0x04, MessageType::CredentialResponse),
            (0xFF, MessageType::Error),
        ] {
            assert_eq!(MessageType::from_byte(tag), Some(ty));
            assert_eq!(ty.as_byte(), tag);
        }
        assert_eq!(MessageType::from_byte(0x05), None);
        assert_eq!(MessageType::from_byte(0x00), None);
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!("success".parse::<CredentialStatus>(), Ok(CredentialStatus::Success));
        assert_eq!("Revoked".parse::<CredentialStatus>(), Ok(CredentialStatus::Revoked));
        assert_eq!(
            " invalid_format ".parse::<CredentialStatus>(),
            Ok(CredentialStatus::InvalidFormat)
        );
        assert!("granted".parse::<CredentialStatus>().is_err());
    }

    #[test]
    fn test_status_bytes() {
        assert_eq!(CredentialStatus::from_byte(0x02), Some(CredentialStatus::Expired));
        assert_eq!(CredentialStatus::from_byte(0x05), None);
        assert_eq!(CredentialStatus::InvalidFormat.as_byte(), 0x04);
    }

    #[test]
    fn test_status_serde_uses_wire_names() {
        let json = serde_json::to_string(&CredentialStatus::InvalidFormat).unwrap();
        assert_eq!(json, "\"INVALID_FORMAT\"");
    }

    #[test]
    fn test_error_code_bytes() {
        assert_eq!(ErrorCode::from_byte(0x04), Some(ErrorCode::InvalidState));
        assert_eq!(ErrorCode::from_byte(0x07), None);
        assert_eq!(ErrorCode::Timeout.as_byte(), 0x06);
        assert_eq!(ErrorCode::DecryptionFailed.describe(), "Authentication failed");
    }
}
