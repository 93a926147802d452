// Message module: wire types and binary framing for the reader protocol

pub mod codec;
pub mod types;

pub use codec::{
    decode_message, encode_credential_response, encode_error, encode_message, parse_frame,
    CodecError, MAX_FRAME_SIZE,
};
pub use types::{
    AuthRequest, AuthResponse, Credential, CredentialStatus, ErrorCode, Message, MessageType,
    UnknownStatus,
};
