//! Key lifecycle: records, the persisted store, and the manager that owns it.

mod manager;
mod record;
mod store;

pub use manager::{KeyInfo, KeyManager, KeySummary};
pub use record::{KeyMaterial, KeyRecord, KeyType};
pub use store::{key_id_for, KeyStore};

use crate::error::Result;

/// Source of key material for the ciphers.
///
/// `KeyManager` is the production implementation; tests substitute
/// fixed keys.
pub trait KeyProvider {
    /// The active, unexpired key that new ciphertext is produced under.
    fn current_key(&self) -> Result<KeyRecord>;

    /// Any key ever created, active or retired.
    fn key_by_id(&self, key_id: &str) -> Option<KeyRecord>;

    /// Key tried for ciphertext that names no key id. Expired keys qualify.
    fn fallback_key(&self) -> Option<KeyRecord>;
}
