//! Trailing key-id framing.
//!
//! Every ciphertext ends with `key_id || len(key_id) as u8`, so the key id
//! is found at a fixed offset from the end without scanning. A length of 0
//! means no key id was embedded.

use crate::error::CryptoError;
use crate::types::MAX_KEY_ID_LENGTH;

/// Append `key_id || len` to `payload`.
///
/// `None` appends a single zero byte.
pub fn append_key_id(payload: &mut Vec<u8>, key_id: Option<&str>) -> Result<(), CryptoError> {
    let id = key_id.unwrap_or_default().as_bytes();
    if id.len() > MAX_KEY_ID_LENGTH {
        return Err(CryptoError::KeyIdTooLong(id.len()));
    }
    payload.reserve(id.len() + 1);
    payload.extend_from_slice(id);
    payload.push(id.len() as u8);
    Ok(())
}

/// Split framed data into `(payload, key_id)`.
///
/// Fails when the data is empty, the declared length overruns the data, or
/// the key id is not UTF-8.
pub fn split_key_id(data: &[u8]) -> Result<(&[u8], Option<&str>), CryptoError> {
    let (&len, rest) = data
        .split_last()
        .ok_or_else(|| CryptoError::InvalidKeyIdTrailer("missing length byte".into()))?;
    let len = len as usize;
    if len == 0 {
        return Ok((rest, None));
    }
    if len > rest.len() {
        return Err(CryptoError::InvalidKeyIdTrailer(format!(
            "declared length {len} exceeds {} available bytes",
            rest.len()
        )));
    }
    let (payload, id) = rest.split_at(rest.len() - len);
    let id = std::str::from_utf8(id)
        .map_err(|_| CryptoError::InvalidKeyIdTrailer("key id is not UTF-8".into()))?;
    Ok((payload, Some(id)))
}
