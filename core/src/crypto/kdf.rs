// Device key derivation
//
// DeviceKey = HKDF-SHA256(ikm = MasterKey, salt = DeviceId, info = "device-key", L = 16)
//
// The master key never leaves the reader. Each enrolled device holds only its
// own derived key, so compromising one handset does not expose the others.

use std::fmt;

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// Size of the master key and every derived device key (AES-128).
pub const KEY_SIZE: usize = 16;

/// Size of the device identifier presented in AUTH_REQUEST.
pub const DEVICE_ID_SIZE: usize = 16;

/// HKDF info string. Changing this invalidates every enrolled device.
const DEVICE_KEY_INFO: &[u8] = b"device-key";

/// Process-wide reader secret. Wiped on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Build a master key from raw bytes; anything but 16 bytes is a config error.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::config("master key", KEY_SIZE, bytes.len()))?;
        Ok(Self(key))
    }

    /// Parse a 32-character hex master key
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidHex("master key"))?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }

    /// Derive the key for one device.
    pub fn derive(&self, device_id: &DeviceId) -> Result<DeviceKey, CryptoError> {
        derive_device_key(&self.0, device_id.as_bytes())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey({})", self.fingerprint())
    }
}

/// 16-byte peer identifier. Not secret.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; DEVICE_ID_SIZE]);

impl DeviceId {
    pub fn new(bytes: [u8; DEVICE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let id: [u8; DEVICE_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::config("device id", DEVICE_ID_SIZE, bytes.len()))?;
        Ok(Self(id))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidHex("device id"))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.to_hex())
    }
}

/// Per-device symmetric key. Derived on demand, never persisted or sent.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DeviceKey([u8; KEY_SIZE]);

impl DeviceKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::config("device key", KEY_SIZE, bytes.len()))?;
        Ok(Self(key))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidHex("device key"))?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Hex form for enrolment output only.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PartialEq for DeviceKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for DeviceKey {}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceKey(..)")
    }
}

/// Derive a device key from the master key and a device identifier.
///
/// Pure: identical inputs always yield identical output. Fails with
/// [`CryptoError::Config`] unless both inputs are exactly 16 bytes.
pub fn derive_device_key(master_key: &[u8], device_id: &[u8]) -> Result<DeviceKey, CryptoError> {
    if master_key.len() != KEY_SIZE {
        return Err(CryptoError::config("master key", KEY_SIZE, master_key.len()));
    }
    if device_id.len() != DEVICE_ID_SIZE {
        return Err(CryptoError::config("device id", DEVICE_ID_SIZE, device_id.len()));
    }

    let hk = Hkdf::<Sha256>::new(Some(device_id), master_key);
    let mut okm = [0u8; KEY_SIZE];
    // 16 bytes is far below the 255 * HashLen limit
    hk.expand(DEVICE_KEY_INFO, &mut okm)
        .map_err(|_| CryptoError::config("device key", KEY_SIZE, okm.len()))?;

    let key = DeviceKey(okm);
    okm.zeroize();
    Ok(key)
}
