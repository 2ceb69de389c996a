//! AES-256-CBC codec for file contents.
//!
//! Layout: [16 bytes: IV][N bytes: ciphertext], N a multiple of 16.
//! Plaintext is PKCS#7-padded before encryption. CBC is unauthenticated:
//! a wrong key surfaces as a padding error most of the time, and
//! occasionally as garbage plaintext.

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::CryptoError;
use crate::keygen::random_bytes;
use crate::types::{AES_BLOCK_SIZE, AES_KEY_LENGTH, CBC_IV_LENGTH};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Append PKCS#7 padding to a full block boundary.
///
/// Always adds at least one byte; aligned input gains a whole block.
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad_len = AES_BLOCK_SIZE - (data.len() % AES_BLOCK_SIZE);
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

/// Strip and validate PKCS#7 padding.
pub fn pkcs7_unpad(data: &[u8]) -> Result<&[u8], CryptoError> {
    if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned(data.len()));
    }
    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len > AES_BLOCK_SIZE {
        return Err(CryptoError::InvalidPadding);
    }
    let (body, padding) = data.split_at(data.len() - pad_len);
    if padding.iter().any(|&b| b as usize != pad_len) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(body)
}

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: key.len(),
        });
    }
    Ok(())
}

/// Encrypt with a fresh random IV. Returns `IV || ciphertext`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv = random_bytes::<CBC_IV_LENGTH>()?;
    encrypt_with_iv(key, &iv, plaintext)
}

/// Encrypt under a caller-supplied IV. Returns `IV || ciphertext`.
pub fn encrypt_with_iv(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    if iv.len() != CBC_IV_LENGTH {
        return Err(CryptoError::InvalidIvLength {
            expected: CBC_IV_LENGTH,
            got: iv.len(),
        });
    }
    let encryptor = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let padded = pkcs7_pad(plaintext);
    let ciphertext = encryptor.encrypt_padded_vec_mut::<NoPadding>(&padded);

    let mut result = Vec::with_capacity(CBC_IV_LENGTH + ciphertext.len());
    result.extend_from_slice(iv);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt `IV || ciphertext` and strip the padding.
pub fn decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    if data.len() < CBC_IV_LENGTH + AES_BLOCK_SIZE {
        return Err(CryptoError::DataTooShort);
    }
    let (iv, ciphertext) = data.split_at(CBC_IV_LENGTH);
    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned(ciphertext.len()));
    }
    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    let padded = decryptor
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    Ok(pkcs7_unpad(&padded)?.to_vec())
}
