//! Field and file codecs on top of the crypto primitives.
//!
//! Both codecs end their output with the producing key's id
//! (`key_id || len as u8`), so decryption only needs a [`KeyProvider`].
//!
//! [`KeyProvider`]: crate::keys::KeyProvider

mod field;
mod file;

pub use field::FieldCipher;
pub use file::{
    default_decrypted_path, default_encrypted_path, EncryptedFile, FileCipher, ENCRYPTED_EXTENSION,
};

use crate::error::{Result, VaultError};
use crate::keys::{KeyProvider, KeyRecord};

/// Key for a ciphertext's embedded id, or the fallback key when it has none.
///
/// An id the provider does not know is a decryption failure.
fn resolve_key<K: KeyProvider + ?Sized>(keys: &K, key_id: Option<&str>) -> Result<KeyRecord> {
    match key_id {
        Some(id) => keys
            .key_by_id(id)
            .ok_or_else(|| VaultError::Decryption(format!("unknown key id {id}"))),
        None => keys
            .fallback_key()
            .ok_or_else(|| VaultError::KeyUnavailable("no current key".into())),
    }
}
