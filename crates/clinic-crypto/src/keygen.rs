//! Random key, nonce, IV and salt generation.

use crate::error::CryptoError;
use crate::types::AES_KEY_LENGTH;

/// Fill a fixed-size array from the OS random source.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(bytes)
}

/// Generate a random 256-bit AES key.
pub fn generate_key() -> Result<[u8; AES_KEY_LENGTH], CryptoError> {
    random_bytes::<AES_KEY_LENGTH>()
}
