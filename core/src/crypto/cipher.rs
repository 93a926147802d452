// AES-128-CBC with PKCS7 padding
//
// encrypt: random IV per call (unless supplied), PKCS7 pad, CBC encrypt.
// decrypt: length check, CBC decrypt without padding, then a constant-time
// PKCS7 check. All failure paths return the same error so a peer cannot use
// the reader as a padding oracle.

use aes::Aes128;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use subtle::{Choice, ConstantTimeEq, ConstantTimeGreater, ConstantTimeLess};
use zeroize::Zeroize;

use super::kdf::KEY_SIZE;
use super::CryptoError;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// CBC initialization vector size
pub const IV_SIZE: usize = 16;

/// Challenge nonce size
pub const NONCE_SIZE: usize = 16;

pub type Iv = [u8; IV_SIZE];
pub type Nonce = [u8; NONCE_SIZE];

/// Generate a random 16-byte nonce
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generate a random 16-byte IV
pub fn generate_iv() -> Iv {
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypt `plaintext` under a 16-byte key.
///
/// Returns `(iv, ciphertext)`. The ciphertext is always a non-zero multiple of
/// 16 bytes and strictly longer than the plaintext; a block-aligned plaintext
/// gains one full padding block.
pub fn encrypt(key: &[u8], plaintext: &[u8], iv: Option<&[u8]>) -> Result<(Iv, Vec<u8>), CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::config("key", KEY_SIZE, key.len()));
    }

    let iv: Iv = match iv {
        Some(supplied) => supplied
            .try_into()
            .map_err(|_| CryptoError::config("iv", IV_SIZE, supplied.len()))?,
        None => generate_iv(),
    };

    let cipher = Aes128CbcEnc::new_from_slices(key, &iv)
        .map_err(|_| CryptoError::config("key", KEY_SIZE, key.len()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok((iv, ciphertext))
}

/// Decrypt `ciphertext` and strip its PKCS7 padding.
///
/// Empty input, a length that is not a block multiple, a wrong key, a corrupted
/// IV and tampered ciphertext all yield [`CryptoError::DecryptionFailed`].
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::config("key", KEY_SIZE, key.len()));
    }
    if iv.len() != IV_SIZE || ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher =
        Aes128CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::DecryptionFailed)?;

    let mut buffer = ciphertext.to_vec();
    let decrypted_len = cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|_| CryptoError::DecryptionFailed)?
        .len();
    buffer.truncate(decrypted_len);

    let (valid, pad_len) = check_pkcs7(&buffer);
    if bool::from(valid) {
        buffer.truncate(buffer.len() - pad_len);
        Ok(buffer)
    } else {
        buffer.zeroize();
        Err(CryptoError::DecryptionFailed)
    }
}

/// Inspect the final block without branching on its contents.
///
/// Always scans all 16 trailing bytes. `buffer` must hold at least one block.
fn check_pkcs7(buffer: &[u8]) -> (Choice, usize) {
    let last = buffer.len() - 1;
    let pad = buffer[last];

    let mut valid = pad.ct_gt(&0) & !pad.ct_gt(&(BLOCK_SIZE as u8));
    for i in 0..BLOCK_SIZE {
        let byte = buffer[last - i];
        let in_padding = (i as u8).ct_lt(&pad);
        valid &= !in_padding | byte.ct_eq(&pad);
    }

    (valid, pad as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; 16] = [0x42; 16];

    #[test]
    fn test_ciphertext_sizes() {
        for (plain_len, expected) in [(0usize, 16usize), (1, 16), (15, 16), (16, 32), (32, 48), (33, 48)] {
            let (_, ct) = encrypt(&KEY, &vec![7u8; plain_len], None).unwrap();
            assert_eq!(ct.len(), expected, "plaintext of {} bytes", plain_len);
            assert!(ct.len() > plain_len);
        }
    }

    #[test]
    fn test_fresh_iv_each_call() {
        let (iv1, ct1) = encrypt(&KEY, b"same input", None).unwrap();
        let (iv2, ct2) = encrypt(&KEY, b"same input", None).unwrap();
        assert_ne!(iv1, iv2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_supplied_iv_is_used() {
        let iv = [9u8; 16];
        let (used, ct) = encrypt(&KEY, b"payload", Some(&iv)).unwrap();
        assert_eq!(used, iv);
        assert_eq!(decrypt(&KEY, &iv, &ct).unwrap(), b"payload");
    }

    #[test]
    fn test_known_answer_aes128_cbc() {
        // NIST SP 800-38A F.2.1, first block, followed by one PKCS7 block
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let plain = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();

        let (_, ct) = encrypt(&key, &plain, Some(&iv)).unwrap();
        assert_eq!(hex::encode(&ct[..16]), "7649abac8119b246cee98e9b12e9197d");
        assert_eq!(ct.len(), 32);
    }

    #[test]
    fn test_rejects_bad_lengths() {
        assert!(matches!(
            encrypt(&[0u8; 15], b"x", None),
            Err(CryptoError::Config { what: "key", .. })
        ));
        assert!(matches!(
            encrypt(&KEY, b"x", Some(&[0u8; 8])),
            Err(CryptoError::Config { what: "iv", .. })
        ));
        assert_eq!(decrypt(&KEY, &[0u8; 16], &[]), Err(CryptoError::DecryptionFailed));
        assert_eq!(decrypt(&KEY, &[0u8; 16], &[0u8; 17]), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (iv, ct) = encrypt(&KEY, b"credential", None).unwrap();
        // A wrong key can occasionally yield valid padding by chance; accept
        // only failure or a different plaintext.
        match decrypt(&[0x43; 16], &iv, &ct) {
            Err(e) => assert_eq!(e, CryptoError::DecryptionFailed),
            Ok(plain) => assert_ne!(plain, b"credential"),
        }
    }

    #[test]
    fn test_pkcs7_check_rejects_zero_and_oversized_pad() {
        let mut block = [0u8; 16];
        assert!(!bool::from(check_pkcs7(&block).0));
        block[15] = 17;
        assert!(!bool::from(check_pkcs7(&block).0));
        block = [16u8; 16];
        let (ok, len) = check_pkcs7(&block);
        assert!(bool::from(ok));
        assert_eq!(len, 16);
        block[0] = 15;
        assert!(!bool::from(check_pkcs7(&block).0));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(key in any::<[u8; 16]>(), plain in proptest::collection::vec(any::<u8>(), 0..1000)) {
            let (iv, ct) = encrypt(&key, &plain, None).unwrap();
            prop_assert_eq!(ct.len() % BLOCK_SIZE, 0);
            prop_assert_eq!(decrypt(&key, &iv, &ct).unwrap(), plain);
        }

        #[test]
        fn prop_last_block_tamper_detected(plain in proptest::collection::vec(any::<u8>(), 0..64), flip in 1u8..=255) {
            let (iv, mut ct) = encrypt(&KEY, &plain, None).unwrap();
            let last = ct.len() - 1;
            ct[last] ^= flip;
            // The final block decrypts to garbage; it only passes when the
            // garbage happens to end in valid padding.
            match decrypt(&KEY, &iv, &ct) {
                Err(e) => prop_assert_eq!(e, CryptoError::DecryptionFailed),
                Ok(out) => prop_assert_ne!(out, plain),
            }
        }

        #[test]
        fn prop_wrong_key_detected(
            key in any::<[u8; 16]>(),
            other in any::<[u8; 16]>(),
            plain in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            prop_assume!(key != other);
            let (iv, ct) = encrypt(&key, &plain, None).unwrap();
            match decrypt(&other, &iv, &ct) {
                Err(e) => prop_assert_eq!(e, CryptoError::DecryptionFailed),
                Ok(out) => prop_assert_ne!(out, plain),
            }
        }

        #[test]
        fn prop_iv_tamper_detected(
            plain in proptest::collection::vec(any::<u8>(), 0..64),
            index in 0usize..IV_SIZE,
            flip in 1u8..=255,
        ) {
            let (mut iv, ct) = encrypt(&KEY, &plain, None).unwrap();
            iv[index] ^= flip;
            match decrypt(&KEY, &iv, &ct) {
                Err(e) => prop_assert_eq!(e, CryptoError::DecryptionFailed),
                Ok(out) => prop_assert_ne!(out, plain),
            }
        }

        #[test]
        fn prop_padding_byte_tamper_detected(
            plain in proptest::collection::vec(any::<u8>(), 16..80),
            flip in 1u8..=255,
        ) {
            // The last byte of the previous block lands on the padding byte
            let (iv, mut ct) = encrypt(&KEY, &plain, None).unwrap();
            let target = ct.len() - BLOCK_SIZE - 1;
            ct[target] ^= flip;
            match decrypt(&KEY, &iv, &ct) {
                Err(e) => prop_assert_eq!(e, CryptoError::DecryptionFailed),
                Ok(out) => prop_assert_ne!(out, plain),
            }
        }
    }
}
