//! AES-256-GCM codec for image bytes at rest.
//!
//! Stateless by design: the caller owns key records and image metadata;
//! this crate only turns (plaintext, key) into (ciphertext, iv, tag) and
//! back. The IV and tag travel as separate metadata fields, not as a
//! blob prefix.

pub mod aead;
pub mod error;
pub mod material;

pub use aead::{generate_iv, open, seal, Sealed, IV_LENGTH, TAG_LENGTH};
pub use error::CryptoError;
pub use material::{KeyMaterial, KEY_LENGTH};
