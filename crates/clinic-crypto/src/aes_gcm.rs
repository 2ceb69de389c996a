//! AES-256-GCM sealing for short values (database fields, key backups).
//!
//! Layout: [12 bytes: nonce][N bytes: ciphertext + tag]
//! No associated data is bound.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::CryptoError;
use crate::keygen::random_bytes;
use crate::types::{AES_GCM_NONCE_LENGTH, AES_GCM_TAG_LENGTH, AES_KEY_LENGTH};

/// Generate a random 12-byte nonce for AES-GCM.
pub fn generate_nonce() -> Result<[u8; AES_GCM_NONCE_LENGTH], CryptoError> {
    random_bytes::<AES_GCM_NONCE_LENGTH>()
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: key.len(),
        });
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// AES-256-GCM bound to one key.
///
/// Useful when a caller seals many values under the same key and wants
/// to skip the key schedule on every call.
pub struct GcmCipher {
    cipher: Aes256Gcm,
}

impl GcmCipher {
    /// # Arguments
    /// * `key` - 32-byte (256-bit) raw key material
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: cipher_for(key)?,
        })
    }

    /// Encrypt with a fresh random nonce. Returns `nonce || ciphertext+tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = generate_nonce()?;
        self.seal_with_nonce(&nonce, plaintext)
    }

    fn seal_with_nonce(
        &self,
        nonce: &[u8; AES_GCM_NONCE_LENGTH],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(AES_GCM_NONCE_LENGTH + ciphertext.len());
        result.extend_from_slice(nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt `nonce || ciphertext+tag`, verifying the tag.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < AES_GCM_NONCE_LENGTH + AES_GCM_TAG_LENGTH {
            return Err(CryptoError::DataTooShort);
        }
        let (nonce, ciphertext) = data.split_at(AES_GCM_NONCE_LENGTH);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

/// One-shot [`GcmCipher::seal`].
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    GcmCipher::new(key)?.seal(plaintext)
}

/// One-shot [`GcmCipher::open`].
pub fn open(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    GcmCipher::new(key)?.open(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut key).unwrap();
        key
    }

    #[test]
    fn seal_open_round_trip() {
        let key = random_key();
        let sealed = seal(&key, b"John Doe").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"John Doe");
    }

    #[test]
    fn layout_is_nonce_then_ciphertext_and_tag() {
        let key = random_key();
        let sealed = seal(&key, &[1, 2, 3]).unwrap();
        assert_eq!(sealed.len(), AES_GCM_NONCE_LENGTH + 3 + AES_GCM_TAG_LENGTH);
    }

    #[test]
    fn fixed_nonce_is_deterministic() {
        let key = random_key();
        let cipher = GcmCipher::new(&key).unwrap();
        let nonce = [5u8; AES_GCM_NONCE_LENGTH];
        let a = cipher.seal_with_nonce(&nonce, b"same").unwrap();
        let b = cipher.seal_with_nonce(&nonce, b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..AES_GCM_NONCE_LENGTH], &nonce);
    }

    #[test]
    fn different_ciphertext_each_time() {
        let key = random_key();
        let cipher = GcmCipher::new(&key).unwrap();
        let enc1 = cipher.seal(b"test").unwrap();
        let enc2 = cipher.seal(b"test").unwrap();
        assert_ne!(enc1, enc2);
        assert_eq!(cipher.open(&enc1).unwrap(), b"test");
        assert_eq!(cipher.open(&enc2).unwrap(), b"test");
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = random_key();
        let mut sealed = seal(&key, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(
            open(&key, &sealed),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn rejects_truncated_data() {
        let key = random_key();
        let err = open(&key, &[0u8; 27]).unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&random_key(), b"secret").unwrap();
        assert!(open(&random_key(), &sealed).is_err());
    }

    #[test]
    fn rejects_bad_key_length() {
        let err = seal(&[0u8; 16], b"data").unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 32,
                got: 16
            }
        ));
    }

    #[test]
    fn handles_empty_plaintext() {
        let key = random_key();
        let sealed = seal(&key, b"").unwrap();
        assert!(open(&key, &sealed).unwrap().is_empty());
    }

    #[test]
    fn handles_large_data() {
        let key = random_key();
        let mut plaintext = vec![0u8; 100 * 1024];
        getrandom::getrandom(&mut plaintext).unwrap();
        let sealed = seal(&key, &plaintext).unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), plaintext);
    }
}
