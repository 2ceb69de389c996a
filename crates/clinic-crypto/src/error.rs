use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid IV length: expected {expected} bytes, got {got}")]
    InvalidIvLength { expected: usize, got: usize },

    #[error("Encrypted data too short")]
    DataTooShort,

    #[error("Ciphertext length {0} is not a multiple of the block size")]
    NotBlockAligned(usize),

    #[error("Invalid padding")]
    InvalidPadding,

    #[error("Key id too long: {0} bytes (max 255)")]
    KeyIdTooLong(usize),

    #[error("Invalid key id trailer: {0}")]
    InvalidKeyIdTrailer(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Salt too short: need at least {min} bytes, got {got}")]
    SaltTooShort { min: usize, got: usize },

    #[error("Random number generation failed: {0}")]
    RngFailed(String),
}
