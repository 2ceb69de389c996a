//! The durable key collection.
//!
//! File shape:
//! `{keys: {<id>: KeyRecord}, current_key_id, master_key: base64|null, last_updated}`
//!
//! Mutations never happen in place. Rotation and restore build a new
//! `KeyStore`, the caller persists it, and only then swaps it in.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{KeyMaterial, KeyRecord};
use crate::error::{Result, VaultError};
use crate::fs::write_atomic;

/// `key_YYYYMMDD_HHMMSS` in UTC.
pub fn key_id_for(now: DateTime<Utc>) -> String {
    now.format("key_%Y%m%d_%H%M%S").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStore {
    keys: BTreeMap<String, KeyRecord>,
    current_key_id: Option<String>,
    master_key: Option<KeyMaterial>,
}

#[derive(Serialize, Deserialize)]
struct StoredKeyStore {
    keys: BTreeMap<String, KeyRecord>,
    current_key_id: Option<String>,
    master_key: Option<String>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

impl KeyStore {
    /// A first-run store: one active key plus a random master key.
    pub fn bootstrap(now: DateTime<Utc>, lifetime_days: i64) -> Result<Self> {
        let record = KeyRecord::generate(key_id_for(now), now, lifetime_days)?;
        let key_id = record.key_id.clone();
        Ok(Self {
            keys: BTreeMap::from([(key_id.clone(), record)]),
            current_key_id: Some(key_id),
            master_key: Some(KeyMaterial::generate()?),
        })
    }

    /// Assemble and validate a store from its parts.
    pub fn from_records(
        records: impl IntoIterator<Item = KeyRecord>,
        current_key_id: Option<String>,
        master_key: Option<KeyMaterial>,
    ) -> Result<Self> {
        let keys = records
            .into_iter()
            .map(|record| (record.key_id.clone(), record))
            .collect();
        let store = Self {
            keys,
            current_key_id,
            master_key,
        };
        store.validate()?;
        Ok(store)
    }

    /// Read the store at `path`. `Ok(None)` when the file does not exist.
    ///
    /// Unparseable or inconsistent content is a `Configuration` error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VaultError::io(path, e)),
        };
        let stored: StoredKeyStore = serde_json::from_slice(&bytes).map_err(|e| {
            VaultError::Configuration(format!("corrupt key store {}: {e}", path.display()))
        })?;
        let master_key = stored
            .master_key
            .as_deref()
            .map(KeyMaterial::from_base64)
            .transpose()?;
        let store = Self {
            keys: stored.keys,
            current_key_id: stored.current_key_id,
            master_key,
        };
        store.validate()?;
        Ok(Some(store))
    }

    /// Atomically write the store with owner-only permissions.
    pub fn persist(&self, path: &Path, now: DateTime<Utc>) -> Result<()> {
        let stored = StoredKeyStore {
            keys: self.keys.clone(),
            current_key_id: self.current_key_id.clone(),
            master_key: self.master_key.as_ref().map(KeyMaterial::to_base64),
            last_updated: Some(now),
        };
        let json = zeroize::Zeroizing::new(serde_json::to_vec_pretty(&stored)?);
        write_atomic(path, &json)
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<()> {
        for (id, record) in &self.keys {
            if id != &record.key_id {
                return Err(VaultError::Configuration(format!(
                    "key stored under {id} claims id {}",
                    record.key_id
                )));
            }
        }
        let active: Vec<&str> = self
            .keys
            .values()
            .filter(|r| r.is_active)
            .map(|r| r.key_id.as_str())
            .collect();
        if active.len() > 1 {
            return Err(VaultError::Configuration(format!(
                "more than one active key: {}",
                active.join(", ")
            )));
        }
        if let Some(current) = &self.current_key_id {
            if !self.keys.contains_key(current) {
                return Err(VaultError::Configuration(format!(
                    "current key {current} is not in the store"
                )));
            }
        }
        if let Some(&active_id) = active.first() {
            if self.current_key_id.as_deref() != Some(active_id) {
                return Err(VaultError::Configuration(format!(
                    "active key {active_id} is not the current key"
                )));
            }
        }
        Ok(())
    }

    pub fn current_key_id(&self) -> Option<&str> {
        self.current_key_id.as_deref()
    }

    pub fn current(&self) -> Option<&KeyRecord> {
        self.current_key_id.as_ref().and_then(|id| self.keys.get(id))
    }

    pub fn get(&self, key_id: &str) -> Option<&KeyRecord> {
        self.keys.get(key_id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyRecord> {
        self.keys.values()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn master_key(&self) -> Option<&KeyMaterial> {
        self.master_key.as_ref()
    }

    /// Id for a key created at `now`, suffixed `_2`, `_3`, ... on collision.
    pub fn next_key_id(&self, now: DateTime<Utc>) -> String {
        let base = key_id_for(now);
        if !self.keys.contains_key(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}_{n}");
            if !self.keys.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// A copy of this store with a new current key. Returns the new key id.
    pub fn with_rotation(
        &self,
        now: DateTime<Utc>,
        lifetime_days: i64,
    ) -> Result<(Self, String)> {
        let mut next = self.clone();
        for record in next.keys.values_mut() {
            record.is_active = false;
        }
        let record = KeyRecord::generate(self.next_key_id(now), now, lifetime_days)?;
        let key_id = record.key_id.clone();
        next.keys.insert(key_id.clone(), record);
        next.current_key_id = Some(key_id.clone());
        if next.master_key.is_none() {
            next.master_key = Some(KeyMaterial::generate()?);
        }
        Ok((next, key_id))
    }

    /// A copy of `restored` that keeps this store's master key.
    pub fn replaced_by(&self, restored: KeyStore) -> Result<Self> {
        Self::from_records(
            restored.keys.into_values(),
            restored.current_key_id,
            self.master_key.clone(),
        )
    }
}
