//! PBKDF2-HMAC-SHA256 key derivation for password-protected backups.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::types::{AES_KEY_LENGTH, PBKDF2_ITERATIONS};

/// Minimum salt length accepted by [`derive_key_from_password`].
const MIN_SALT_LENGTH: usize = 16;

/// Derive a 256-bit key from a password.
///
/// # Arguments
/// * `password` - UTF-8 password; its bytes are fed to HMAC-SHA256 as-is
/// * `salt` - Random salt stored next to whatever the key protects
///
/// # Returns
/// 32-byte derived key, zeroized on drop
pub fn derive_key_from_password(
    password: &str,
    salt: &[u8],
) -> Result<Zeroizing<[u8; AES_KEY_LENGTH]>, CryptoError> {
    derive_key_with_iterations(password, salt, PBKDF2_ITERATIONS)
}

/// Same as [`derive_key_from_password`] with an explicit iteration count.
pub fn derive_key_with_iterations(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; AES_KEY_LENGTH]>, CryptoError> {
    if salt.len() < MIN_SALT_LENGTH {
        return Err(CryptoError::SaltTooShort {
            min: MIN_SALT_LENGTH,
            got: salt.len(),
        });
    }
    let mut okm = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut okm[..]);
    Ok(okm)
}
