use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid IV length: expected {expected} bytes, got {got}")]
    InvalidIvLength { expected: usize, got: usize },

    #[error("Invalid auth tag length: expected {expected} bytes, got {got}")]
    InvalidTagLength { expected: usize, got: usize },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Cipher initialization failed: {0}")]
    CipherInit(String),

    /// Authentication-tag verification failed on decrypt. Signals tampering
    /// or corruption; the caller must never see unverified plaintext.
    #[error("Authentication tag verification failed")]
    IntegrityFailure,

    #[error("Random number generation failed: {0}")]
    RngFailed(String),
}
