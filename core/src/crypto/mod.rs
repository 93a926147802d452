// Cryptography module: device key derivation and AES-128-CBC framing

pub mod cipher;
pub mod kdf;

use thiserror::Error;

pub use cipher::{decrypt, encrypt, generate_iv, generate_nonce, Iv, Nonce, BLOCK_SIZE, IV_SIZE, NONCE_SIZE};
pub use kdf::{derive_device_key, DeviceId, DeviceKey, MasterKey, DEVICE_ID_SIZE, KEY_SIZE};

/// Errors from the cryptographic layer.
///
/// Every decryption fault (bad length, wrong key, corrupted IV, bad padding)
/// collapses into the single `DecryptionFailed` variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("{what} must be {expected} bytes, got {got}")]
    Config {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Invalid hex encoding for {0}")]
    InvalidHex(&'static str),
    #[error("Decryption failed")]
    DecryptionFailed,
}

impl CryptoError {
    pub(crate) fn config(what: &'static str, expected: usize, got: usize) -> Self {
        CryptoError::Config {
            what,
            expected,
            got,
        }
    }
}
