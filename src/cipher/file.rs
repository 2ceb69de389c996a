//! Whole-file encryption.
//!
//! Output: `IV[16] || AES-256-CBC ciphertext || key_id || len(key_id)`.
//!
//! This codec provides confidentiality only. CBC carries no authentication
//! tag, so integrity is the caller's job: keep the `plaintext_sha256` from
//! [`EncryptedFile`] (encrypted, alongside the record) and check it with
//! [`FileCipher::decrypt_verified`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clinic_crypto::{aes_cbc, append_key_id, sha256_hex, split_key_id};
use serde::Serialize;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::resolve_key;
use crate::error::{Result, VaultError};
use crate::fs::write_atomic;
use crate::keys::KeyProvider;

pub const ENCRYPTED_EXTENSION: &str = "enc";

/// Result of encrypting one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptedFile {
    pub path: PathBuf,
    pub key_id: String,
    pub plaintext_sha256: String,
}

/// `<source>.enc`
pub fn default_encrypted_path(source: &Path) -> PathBuf {
    with_suffix(source, ".enc")
}

/// Strip a trailing `.enc`, otherwise append `.dec`.
pub fn default_decrypted_path(encrypted: &Path) -> PathBuf {
    if encrypted.extension().is_some_and(|ext| ext == ENCRYPTED_EXTENSION) {
        encrypted.with_extension("")
    } else {
        with_suffix(encrypted, ".dec")
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub struct FileCipher<'a, K: KeyProvider + ?Sized> {
    keys: &'a K,
}

impl<'a, K: KeyProvider + ?Sized> FileCipher<'a, K> {
    pub fn new(keys: &'a K) -> Self {
        Self { keys }
    }

    /// Encrypt `source` to `<source>.enc`.
    pub fn encrypt(&self, source: &Path) -> Result<EncryptedFile> {
        self.encrypt_to(source, &default_encrypted_path(source))
    }

    /// Encrypt `source` to `destination`. The output appears atomically.
    pub fn encrypt_to(&self, source: &Path, destination: &Path) -> Result<EncryptedFile> {
        let plaintext =
            Zeroizing::new(std::fs::read(source).map_err(|e| VaultError::io(source, e))?);
        let key = self.keys.current_key()?;

        let mut framed = aes_cbc::encrypt(key.key.as_bytes(), &plaintext)?;
        append_key_id(&mut framed, Some(&key.key_id))?;
        write_atomic(destination, &framed)?;

        debug!(
            source = %source.display(),
            destination = %destination.display(),
            key_id = %key.key_id,
            bytes = plaintext.len(),
            "Encrypted file"
        );
        Ok(EncryptedFile {
            path: destination.to_path_buf(),
            key_id: key.key_id.clone(),
            plaintext_sha256: sha256_hex(&plaintext),
        })
    }

    /// Decrypt `encrypted` next to itself (see [`default_decrypted_path`]).
    pub fn decrypt(&self, encrypted: &Path) -> Result<PathBuf> {
        let destination = default_decrypted_path(encrypted);
        self.decrypt_to(encrypted, &destination)?;
        Ok(destination)
    }

    /// Decrypt `encrypted` into `destination`. The output appears atomically.
    pub fn decrypt_to(&self, encrypted: &Path, destination: &Path) -> Result<()> {
        let plaintext = self.decrypt_bytes(encrypted)?;
        write_atomic(destination, &plaintext)
    }

    /// Decrypt and check the plaintext against a stored SHA-256 before writing.
    pub fn decrypt_verified(&self, encrypted: &Path, expected_sha256: &str) -> Result<PathBuf> {
        let destination = default_decrypted_path(encrypted);
        self.decrypt_verified_to(encrypted, expected_sha256, &destination)?;
        Ok(destination)
    }

    pub fn decrypt_verified_to(
        &self,
        encrypted: &Path,
        expected_sha256: &str,
        destination: &Path,
    ) -> Result<()> {
        let plaintext = self.decrypt_bytes_verified(encrypted, expected_sha256)?;
        write_atomic(destination, &plaintext)
    }

    /// Decrypt into memory; a plaintext whose SHA-256 differs from
    /// `expected_sha256` is a decryption error.
    pub fn decrypt_bytes_verified(
        &self,
        encrypted: &Path,
        expected_sha256: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let plaintext = self.decrypt_bytes(encrypted)?;
        if !sha256_hex(&plaintext).eq_ignore_ascii_case(expected_sha256) {
            warn!(path = %encrypted.display(), "Decrypted file failed integrity check");
            return Err(VaultError::Decryption(format!(
                "content hash mismatch for {}",
                encrypted.display()
            )));
        }
        Ok(plaintext)
    }

    /// Decrypt `encrypted` into memory.
    pub fn decrypt_bytes(&self, encrypted: &Path) -> Result<Zeroizing<Vec<u8>>> {
        let data = std::fs::read(encrypted).map_err(|e| VaultError::io(encrypted, e))?;
        let (body, key_id) = split_key_id(&data).map_err(VaultError::decryption)?;
        let key = resolve_key(self.keys, key_id)?;
        let plaintext =
            aes_cbc::decrypt(key.key.as_bytes(), body).map_err(VaultError::decryption)?;
        Ok(Zeroizing::new(plaintext))
    }

    /// The key id at the end of an encrypted file.
    pub fn embedded_key_id(encrypted: &Path) -> Result<Option<String>> {
        let data = std::fs::read(encrypted).map_err(|e| VaultError::io(encrypted, e))?;
        let (_, key_id) = split_key_id(&data).map_err(VaultError::decryption)?;
        Ok(key_id.map(str::to_owned))
    }
}
