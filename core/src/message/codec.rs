// Message codec: bit-exact framing with size limits
//
// Frame: [type (1)][body]. Every parse failure is a `CodecError`, never a panic.

use thiserror::Error;

use super::types::{
    AuthRequest, AuthResponse, Credential, CredentialStatus, ErrorCode, Message, MessageType,
};
use crate::crypto::{DeviceId, Iv, BLOCK_SIZE, DEVICE_ID_SIZE, IV_SIZE};

/// Largest frame accepted or produced: one GATT characteristic value.
pub const MAX_FRAME_SIZE: usize = 512;

/// AUTH_REQUEST body floor: DeviceId + IV + one cipher block
pub const AUTH_REQUEST_MIN_BODY: usize = DEVICE_ID_SIZE + IV_SIZE + BLOCK_SIZE;

/// Enc(NonceMobile || NonceReader): 32 bytes of plaintext plus a full PKCS7 block
pub const ENCRYPTED_NONCES_SIZE: usize = 48;

/// AUTH_RESPONSE body: IV + encrypted nonce pair
pub const AUTH_RESPONSE_BODY: usize = IV_SIZE + ENCRYPTED_NONCES_SIZE;

/// CREDENTIAL body floor: IV + one cipher block
pub const CREDENTIAL_MIN_BODY: usize = IV_SIZE + BLOCK_SIZE;

/// CREDENTIAL_RESPONSE / ERROR body: one code byte
pub const CODE_BODY: usize = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty frame")]
    Empty,
    #[error("Frame too large: {0} bytes (max 512)")]
    TooLarge(usize),
    #[error("Unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("{message_type} body too short: {got} bytes (minimum {min})")]
    Truncated {
        message_type: MessageType,
        min: usize,
        got: usize,
    },
    #[error("Unknown {field} code 0x{code:02x}")]
    UnknownCode { field: &'static str, code: u8 },
}

/// Minimum body length for each message type
pub fn min_body_len(message_type: MessageType) -> usize {
    match message_type {
        MessageType::AuthRequest => AUTH_REQUEST_MIN_BODY,
        MessageType::AuthResponse => AUTH_RESPONSE_BODY,
        MessageType::Credential => CREDENTIAL_MIN_BODY,
        MessageType::CredentialResponse | MessageType::Error => CODE_BODY,
    }
}

/// Split a frame into its type tag and body without validating the body.
pub fn parse_frame(bytes: &[u8]) -> Result<(MessageType, &[u8]), CodecError> {
    let (&tag, body) = bytes.split_first().ok_or(CodecError::Empty)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    let message_type = MessageType::from_byte(tag).ok_or(CodecError::UnknownType(tag))?;
    Ok((message_type, body))
}

fn require(message_type: MessageType, body: &[u8]) -> Result<(), CodecError> {
    let min = min_body_len(message_type);
    if body.len() < min {
        return Err(CodecError::Truncated {
            message_type,
            min,
            got: body.len(),
        });
    }
    Ok(())
}

fn read_iv(bytes: &[u8]) -> Iv {
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&bytes[..IV_SIZE]);
    iv
}

/// Decode an AUTH_REQUEST body. Everything after DeviceId and IV is the
/// encrypted nonce.
pub fn decode_auth_request(body: &[u8]) -> Result<AuthRequest, CodecError> {
    require(MessageType::AuthRequest, body)?;
    let (id, rest) = body.split_at(DEVICE_ID_SIZE);
    let mut device_id = [0u8; DEVICE_ID_SIZE];
    device_id.copy_from_slice(id);

    Ok(AuthRequest {
        device_id: DeviceId::new(device_id),
        iv: read_iv(rest),
        encrypted_nonce: rest[IV_SIZE..].to_vec(),
    })
}

pub fn decode_auth_response(body: &[u8]) -> Result<AuthResponse, CodecError> {
    require(MessageType::AuthResponse, body)?;
    Ok(AuthResponse {
        iv: read_iv(body),
        encrypted_nonces: body[IV_SIZE..AUTH_RESPONSE_BODY].to_vec(),
    })
}

pub fn decode_credential(body: &[u8]) -> Result<Credential, CodecError> {
    require(MessageType::Credential, body)?;
    Ok(Credential {
        iv: read_iv(body),
        encrypted_payload: body[IV_SIZE..].to_vec(),
    })
}

/// Decode a full frame into a [`Message`].
pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    let (message_type, body) = parse_frame(bytes)?;
    match message_type {
        MessageType::AuthRequest => decode_auth_request(body).map(Message::AuthRequest),
        MessageType::AuthResponse => decode_auth_response(body).map(Message::AuthResponse),
        MessageType::Credential => decode_credential(body).map(Message::Credential),
        MessageType::CredentialResponse => {
            require(message_type, body)?;
            CredentialStatus::from_byte(body[0])
                .map(Message::CredentialResponse)
                .ok_or(CodecError::UnknownCode {
                    field: "status",
                    code: body[0],
                })
        }
        MessageType::Error => {
            require(message_type, body)?;
            ErrorCode::from_byte(body[0])
                .map(Message::Error)
                .ok_or(CodecError::UnknownCode {
                    field: "error",
                    code: body[0],
                })
        }
    }
}

impl AuthRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + DEVICE_ID_SIZE + IV_SIZE + self.encrypted_nonce.len());
        out.push(MessageType::AuthRequest.as_byte());
        out.extend_from_slice(self.device_id.as_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.encrypted_nonce);
        out
    }
}

impl AuthResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + IV_SIZE + self.encrypted_nonces.len());
        out.push(MessageType::AuthResponse.as_byte());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.encrypted_nonces);
        out
    }
}

impl Credential {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + IV_SIZE + self.encrypted_payload.len());
        out.push(MessageType::Credential.as_byte());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.encrypted_payload);
        out
    }
}

/// CREDENTIAL_RESPONSE frame
pub fn encode_credential_response(status: CredentialStatus) -> Vec<u8> {
    vec![MessageType::CredentialResponse.as_byte(), status.as_byte()]
}

/// ERROR frame
pub fn encode_error(code: ErrorCode) -> Vec<u8> {
    vec![MessageType::Error.as_byte(), code.as_byte()]
}

/// Serialize a [`Message`] into its frame
pub fn encode_message(message: &Message) -> Vec<u8> {
    match message {
        Message::AuthRequest(m) => m.encode(),
        Message::AuthResponse(m) => m.encode(),
        Message::Credential(m) => m.encode(),
        Message::CredentialResponse(status) => encode_credential_response(*status),
        Message::Error(code) => encode_error(*code),
    }
}
