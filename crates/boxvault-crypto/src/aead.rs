//! AES-256-GCM seal/open with detached IV and authentication tag.
//!
//! Every seal draws a fresh 12-byte nonce from the CSPRNG. Nonce reuse
//! under one key breaks GCM, so the nonce is never caller-supplied.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};

use crate::error::CryptoError;
use crate::material::KeyMaterial;

/// AES-GCM nonce length in bytes (96 bits).
pub const IV_LENGTH: usize = 12;

/// AES-GCM authentication tag length in bytes (128 bits).
pub const TAG_LENGTH: usize = 16;

/// Output of [`seal`]. The caller persists all three parts together with
/// the key id as one atomic metadata update.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LENGTH],
    pub tag: [u8; TAG_LENGTH],
}

/// Generate a random 12-byte IV for AES-GCM.
pub fn generate_iv() -> Result<[u8; IV_LENGTH], CryptoError> {
    let mut iv = [0u8; IV_LENGTH];
    getrandom::getrandom(&mut iv).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(iv)
}

/// Encrypt `plaintext` under `key` with a fresh nonce.
pub fn seal(plaintext: &[u8], key: &KeyMaterial) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::CipherInit(e.to_string()))?;
    let iv = generate_iv()?;
    let nonce = Nonce::from_slice(&iv);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, b"", &mut buffer)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(Sealed {
        ciphertext: buffer,
        iv,
        tag: tag.into(),
    })
}

/// Decrypt `ciphertext` with tag verification.
///
/// Returns [`CryptoError::IntegrityFailure`] when the tag does not verify.
/// That condition is kept distinct from shape errors: it signals tampering
/// or corruption, and no plaintext is returned.
pub fn open(
    ciphertext: &[u8],
    iv: &[u8],
    tag: &[u8],
    key: &KeyMaterial,
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != IV_LENGTH {
        return Err(CryptoError::InvalidIvLength {
            expected: IV_LENGTH,
            got: iv.len(),
        });
    }
    if tag.len() != TAG_LENGTH {
        return Err(CryptoError::InvalidTagLength {
            expected: TAG_LENGTH,
            got: tag.len(),
        });
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::CipherInit(e.to_string()))?;
    let nonce = Nonce::from_slice(iv);

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(nonce, b"", &mut buffer, Tag::from_slice(tag))
        .map_err(|_| CryptoError::IntegrityFailure)?;

    Ok(buffer)
}
