use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::model::{unix_now, SecretRecord};
use super::SecretStore;
use crate::error::{Result, SecretError};

/// Non-durable store for tests and `serve --ephemeral`.
///
/// Same semantics as the redb adapter; a single mutex makes every operation
/// atomic with respect to the others.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SecretRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records physically held, expired ones included.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<String, SecretRecord>>> {
        self.records
            .lock()
            .map_err(|_| SecretError::store(anyhow::anyhow!("memory store lock poisoned")))
    }
}

impl SecretStore for MemoryStore {
    fn create(&self, record: &SecretRecord) -> Result<()> {
        let mut records = self.records()?;
        if let Some(existing) = records.get(&record.secret_key) {
            if !existing.is_expired(unix_now()) {
                return Err(SecretError::Conflict);
            }
        }
        records.insert(record.secret_key.clone(), record.clone());
        Ok(())
    }

    fn lookup(&self, secret_key: &str) -> Result<Option<SecretRecord>> {
        let now = unix_now();
        Ok(self
            .records()?
            .get(secret_key)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    fn delete(&self, secret_key: &str) -> Result<()> {
        self.records()?.remove(secret_key);
        Ok(())
    }

    fn fetch_and_delete(&self, secret_key: &str) -> Result<Option<SecretRecord>> {
        let now = unix_now();
        Ok(self
            .records()?
            .remove(secret_key)
            .filter(|r| !r.is_expired(now)))
    }

    fn prune_expired(&self) -> Result<usize> {
        let now = unix_now();
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok(before - records.len())
    }
}
