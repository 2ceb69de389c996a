//! A single symmetric key and its validity window.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use clinic_crypto::AES_KEY_LENGTH;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::VaultError;

/// 256-bit key material, zeroized on drop.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; AES_KEY_LENGTH]);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; AES_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Fresh random key from the OS source.
    pub fn generate() -> Result<Self, VaultError> {
        Ok(Self(clinic_crypto::generate_key()?))
    }

    /// Avoid storing or logging this value.
    pub fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.0
    }

    pub(crate) fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub(crate) fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let decoded = zeroize::Zeroizing::new(
            BASE64
                .decode(encoded)
                .map_err(|e| VaultError::Configuration(format!("invalid key data: {e}")))?,
        );
        let bytes: [u8; AES_KEY_LENGTH] = decoded.as_slice().try_into().map_err(|_| {
            VaultError::Configuration(format!(
                "key data must be {AES_KEY_LENGTH} bytes, got {}",
                decoded.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "AES-256")]
    Aes256,
}

/// One key plus metadata. Never removed from the store once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredKeyRecord", into = "StoredKeyRecord")]
pub struct KeyRecord {
    pub key_id: String,
    pub key: KeyMaterial,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub key_type: KeyType,
    pub is_active: bool,
}

impl KeyRecord {
    /// A new active AES-256 key valid for `lifetime_days` from `now`.
    pub fn generate(
        key_id: String,
        now: DateTime<Utc>,
        lifetime_days: i64,
    ) -> Result<Self, VaultError> {
        Ok(Self {
            key_id,
            key: KeyMaterial::generate()?,
            created_at: now,
            expires_at: now + chrono::Duration::days(lifetime_days),
            key_type: KeyType::Aes256,
            is_active: true,
        })
    }

    /// Whole days until expiry, rounded down. Negative once expired.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// On-disk shape: key material as base64 under `key_data`.
#[derive(Serialize, Deserialize)]
struct StoredKeyRecord {
    key_id: String,
    key_data: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    key_type: KeyType,
    is_active: bool,
}

impl From<KeyRecord> for StoredKeyRecord {
    fn from(record: KeyRecord) -> Self {
        Self {
            key_data: record.key.to_base64(),
            key_id: record.key_id.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            key_type: record.key_type,
            is_active: record.is_active,
        }
    }
}

impl TryFrom<StoredKeyRecord> for KeyRecord {
    type Error = VaultError;

    fn try_from(mut stored: StoredKeyRecord) -> Result<Self, Self::Error> {
        let key = KeyMaterial::from_base64(&stored.key_data);
        stored.key_data.zeroize();
        Ok(Self {
            key: key?,
            key_id: stored.key_id,
            created_at: stored.created_at,
            expires_at: stored.expires_at,
            key_type: stored.key_type,
            is_active: stored.is_active,
        })
    }
}
