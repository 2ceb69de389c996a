//! Authenticated text encryption for database fields.
//!
//! Output: `base64(nonce[12] || ciphertext+tag || key_id || len(key_id))`.
//! The empty string maps to itself in both directions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clinic_crypto::{append_key_id, split_key_id};
use tracing::debug;

use super::resolve_key;
use crate::error::{Result, VaultError};
use crate::keys::{KeyProvider, KeyRecord};

pub struct FieldCipher<'a, K: KeyProvider + ?Sized> {
    keys: &'a K,
}

impl<'a, K: KeyProvider + ?Sized> FieldCipher<'a, K> {
    pub fn new(keys: &'a K) -> Self {
        Self { keys }
    }

    /// Encrypt under the current key.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let key = self.keys.current_key()?;
        seal_under(&key, plaintext)
    }

    /// Encrypt under a named key, retired or not.
    pub fn encrypt_with_key(&self, plaintext: &str, key_id: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let key = self
            .keys
            .key_by_id(key_id)
            .ok_or_else(|| VaultError::KeyUnavailable(format!("unknown key id {key_id}")))?;
        seal_under(&key, plaintext)
    }

    /// Decrypt with whichever key the ciphertext names.
    ///
    /// Every malformed input is reported as `Decryption`.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        let framed = BASE64
            .decode(ciphertext)
            .map_err(|e| VaultError::Decryption(format!("invalid base64: {e}")))?;
        let (sealed, key_id) = split_key_id(&framed).map_err(VaultError::decryption)?;
        let key = resolve_key(self.keys, key_id)?;
        if key_id.is_none() {
            debug!(key_id = %key.key_id, "Field has no key id, using current key");
        }
        let plaintext =
            clinic_crypto::open(key.key.as_bytes(), sealed).map_err(VaultError::decryption)?;
        String::from_utf8(plaintext)
            .map_err(|_| VaultError::Decryption("plaintext is not UTF-8".into()))
    }

    /// The key id embedded in a ciphertext, without decrypting it.
    pub fn embedded_key_id(ciphertext: &str) -> Result<Option<String>> {
        if ciphertext.is_empty() {
            return Ok(None);
        }
        let framed = BASE64
            .decode(ciphertext)
            .map_err(|e| VaultError::Decryption(format!("invalid base64: {e}")))?;
        let (_, key_id) = split_key_id(&framed).map_err(VaultError::decryption)?;
        Ok(key_id.map(str::to_owned))
    }
}

fn seal_under(key: &KeyRecord, plaintext: &str) -> Result<String> {
    let mut framed = clinic_crypto::seal(key.key.as_bytes(), plaintext.as_bytes())?;
    append_key_id(&mut framed, Some(&key.key_id))?;
    Ok(BASE64.encode(framed))
}
