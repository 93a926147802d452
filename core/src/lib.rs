// Credential Reader Core
//
// BLE peripheral side of a symmetric challenge-response protocol. A mobile
// device proves it holds a key derived from the site master key, then hands
// over an encrypted credential for an allow/deny decision.

pub mod client;
pub mod crypto;
pub mod message;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;
pub mod validation;

use thiserror::Error;

pub use client::{ClientError, MobileSession};
pub use crypto::{CryptoError, DeviceId, DeviceKey, MasterKey};
pub use message::{CredentialStatus, ErrorCode, Message, MessageType};
pub use protocol::{HandleOutcome, HandlerConfig, PendingCredential, ProtocolHandler};
pub use service::ReaderService;
pub use session::{ConnectionState, SessionStore};
pub use transport::{ConnectionId, LoopbackTransport, ReaderTransport, TransportError};
pub use validation::{ValidationConfig, ValidationDelegate, ValidationRequest, ValidationResponse};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Reasons the reader refuses a frame. Each maps onto a wire error code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message")]
    InvalidMessage,
    #[error("Message not allowed in current state")]
    InvalidState,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Unknown device")]
    UnknownDevice,
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Configuration error: {0}")]
    Config(CryptoError),
}

impl ProtocolError {
    /// Code carried in the ERROR frame sent back to the peer
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::InvalidMessage => ErrorCode::InvalidMessage,
            ProtocolError::InvalidState => ErrorCode::InvalidState,
            ProtocolError::DecryptionFailed => ErrorCode::DecryptionFailed,
            ProtocolError::UnknownDevice => ErrorCode::UnknownDevice,
            ProtocolError::AuthFailed | ProtocolError::Config(_) => ErrorCode::AuthFailed,
        }
    }
}

impl From<message::CodecError> for ProtocolError {
    fn from(_err: message::CodecError) -> Self {
        ProtocolError::InvalidMessage
    }
}
