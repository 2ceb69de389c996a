/// AES key length in bytes (256 bits).
pub const AES_KEY_LENGTH: usize = 32;

/// AES-GCM nonce length in bytes (96 bits per NIST recommendation).
pub const AES_GCM_NONCE_LENGTH: usize = 12;

/// AES-GCM tag length in bytes (128 bits).
pub const AES_GCM_TAG_LENGTH: usize = 16;

/// AES block size, which is also the CBC IV length.
pub const AES_BLOCK_SIZE: usize = 16;

/// CBC IV length in bytes.
pub const CBC_IV_LENGTH: usize = AES_BLOCK_SIZE;

/// PBKDF2-HMAC-SHA256 iteration count for password-derived keys.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length for password-derived keys.
pub const PBKDF2_SALT_LENGTH: usize = 32;

/// Longest key id that fits the one-byte length trailer.
pub const MAX_KEY_ID_LENGTH: usize = u8::MAX as usize;
