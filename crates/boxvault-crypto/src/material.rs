//! Raw symmetric key material.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Length of a data-encryption key in bytes (256 bits).
pub const KEY_LENGTH: usize = 32;

/// 256-bit symmetric key material, zeroized on drop.
///
/// Debug output is redacted so key bytes never land in logs or panic
/// messages.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LENGTH]);

impl KeyMaterial {
    /// Generate fresh key material from the system CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LENGTH];
        getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Wrap existing key bytes. Fails unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_32_bytes() {
        let km = KeyMaterial::generate().unwrap();
        assert_eq!(km.as_bytes().len(), KEY_LENGTH);
    }

    #[test]
    fn generate_is_unique() {
        let a = KeyMaterial::generate().unwrap();
        let b = KeyMaterial::generate().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn from_slice_round_trip() {
        let bytes = [7u8; KEY_LENGTH];
        let km = KeyMaterial::from_slice(&bytes).unwrap();
        assert_eq!(km.as_bytes(), &bytes);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(KeyMaterial::from_slice(&[0u8; 16]).is_err());
        assert!(KeyMaterial::from_slice(&[0u8; 33]).is_err());
    }

    #[test]
    fn debug_is_redacted() {
        let km = KeyMaterial::from_slice(&[0xAB; KEY_LENGTH]).unwrap();
        let rendered = format!("{:?}", km);
        assert_eq!(rendered, "KeyMaterial(..)");
        assert!(!rendered.contains("ab"));
    }
}
