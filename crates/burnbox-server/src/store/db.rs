use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::model::{unix_now, SecretRecord};
use super::SecretStore;
use crate::error::{Result, SecretError};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Marker byte for the current record encoding. Any other leading byte is
/// rejected on decode.
const RECORD_V1_MARKER: u8 = 0x01;

/// Durable store backed by a single redb file.
///
/// redb serializes write transactions, so `create` and `fetch_and_delete`
/// each run their check and mutation inside one write transaction.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure the table exists.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    fn remove_now(&self, secret_key: &str) -> Result<Option<SecretRecord>> {
        let write_txn = self.db.begin_write().map_err(SecretError::store)?;
        let removed = {
            let mut table = write_txn.open_table(SECRETS).map_err(SecretError::store)?;
            // Clone the bytes so the guard's borrow of `table` ends here.
            let raw: Option<Vec<u8>> = table
                .remove(secret_key)
                .map_err(SecretError::store)?
                .map(|guard| guard.value().to_vec());
            raw.map(|bytes| decode(&bytes)).transpose()?
        };
        write_txn.commit().map_err(SecretError::store)?;
        Ok(removed)
    }
}

impl SecretStore for RedbStore {
    fn create(&self, record: &SecretRecord) -> Result<()> {
        let bytes = encode(record)?;
        let now = unix_now();

        let write_txn = self.db.begin_write().map_err(SecretError::store)?;
        {
            let mut table = write_txn.open_table(SECRETS).map_err(SecretError::store)?;

            let existing: Option<Vec<u8>> = table
                .get(record.secret_key.as_str())
                .map_err(SecretError::store)?
                .map(|guard| guard.value().to_vec());

            // An expired leftover the sweep has not reached yet does not count.
            if let Some(existing) = existing {
                if !decode(&existing)?.is_expired(now) {
                    return Err(SecretError::Conflict);
                }
            }

            table
                .insert(record.secret_key.as_str(), bytes.as_slice())
                .map_err(SecretError::store)?;
        }
        write_txn.commit().map_err(SecretError::store)?;

        debug!(key = %record.secret_key, "stored secret");
        Ok(())
    }

    fn lookup(&self, secret_key: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read().map_err(SecretError::store)?;
        let table = read_txn.open_table(SECRETS).map_err(SecretError::store)?;

        let raw: Option<Vec<u8>> = table
            .get(secret_key)
            .map_err(SecretError::store)?
            .map(|guard| guard.value().to_vec());

        match raw {
            None => Ok(None),
            Some(bytes) => {
                let record = decode(&bytes)?;
                if record.is_expired(unix_now()) {
                    Ok(None)
                } else {
                    Ok(Some(record))
                }
            }
        }
    }

    fn delete(&self, secret_key: &str) -> Result<()> {
        self.remove_now(secret_key)?;
        Ok(())
    }

    fn fetch_and_delete(&self, secret_key: &str) -> Result<Option<SecretRecord>> {
        let removed = self.remove_now(secret_key)?;
        match removed {
            Some(record) if record.is_expired(unix_now()) => {
                debug!(key = %secret_key, "lazy-evicted expired secret");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn prune_expired(&self) -> Result<usize> {
        let now = unix_now();

        let write_txn = self.db.begin_write().map_err(SecretError::store)?;
        let removed = {
            let mut table = write_txn.open_table(SECRETS).map_err(SecretError::store)?;
            let mut expired_keys = Vec::new();
            for item in table.iter().map_err(SecretError::store)? {
                let (k, v) = item.map_err(SecretError::store)?;
                if decode(v.value())?.is_expired(now) {
                    expired_keys.push(k.value().to_owned());
                }
            }
            for key in &expired_keys {
                table.remove(key.as_str()).map_err(SecretError::store)?;
            }
            expired_keys.len()
        };
        write_txn.commit().map_err(SecretError::store)?;
        Ok(removed)
    }
}

/// Encode a record as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")
        .map_err(SecretError::store)?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode")
                    .map_err(SecretError::store)?;
            Ok(record)
        }
        Some((marker, _)) => Err(SecretError::store(anyhow::anyhow!(
            "unknown record marker {marker:#04x}"
        ))),
        None => Err(SecretError::store(anyhow::anyhow!("empty record"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn record(key: &str, ttl: i64) -> SecretRecord {
        let now = unix_now();
        SecretRecord {
            secret_key: key.into(),
            secret: format!("token-for-{key}"),
            expiration: now + ttl,
            created_at: now,
            salt: None,
        }
    }

    #[test]
    fn create_lookup_delete() {
        let (s, _dir) = make_store();
        let r = record("K1", 3600);
        s.create(&r).unwrap();
        assert_eq!(s.lookup("K1").unwrap(), Some(r));
        s.delete("K1").unwrap();
        assert_eq!(s.lookup("K1").unwrap(), None);
    }

    #[test]
    fn delete_absent_is_ok() {
        let (s, _dir) = make_store();
        s.delete("NOPE").unwrap();
    }

    #[test]
    fn create_reports_conflict_and_keeps_original() {
        let (s, _dir) = make_store();
        let first = record("DUP", 3600);
        s.create(&first).unwrap();
        let mut second = record("DUP", 3600);
        second.secret = "other".into();
        assert!(matches!(s.create(&second), Err(SecretError::Conflict)));
        assert_eq!(s.lookup("DUP").unwrap(), Some(first));
    }

    #[test]
    fn create_may_replace_expired_leftover() {
        let (s, _dir) = make_store();
        s.create(&record("OLD", 0)).unwrap();
        let fresh = record("OLD", 3600);
        s.create(&fresh).unwrap();
        assert_eq!(s.lookup("OLD").unwrap(), Some(fresh));
    }

    #[test]
    fn expired_is_invisible_before_sweep() {
        let (s, _dir) = make_store();
        s.create(&record("EXPIRED", 0)).unwrap();
        assert_eq!(s.lookup("EXPIRED").unwrap(), None);
        assert_eq!(s.fetch_and_delete("EXPIRED").unwrap(), None);
    }

    #[test]
    fn fetch_and_delete_returns_once() {
        let (s, _dir) = make_store();
        let r = record("ONCE", 3600);
        s.create(&r).unwrap();
        assert_eq!(s.fetch_and_delete("ONCE").unwrap(), Some(r));
        assert_eq!(s.fetch_and_delete("ONCE").unwrap(), None);
        assert_eq!(s.lookup("ONCE").unwrap(), None);
    }

    #[test]
    fn prune_removes_only_expired() {
        let (s, _dir) = make_store();
        s.create(&record("LIVE", 3600)).unwrap();
        s.create(&record("DEAD1", 0)).unwrap();
        s.create(&record("DEAD2", -10)).unwrap();
        assert_eq!(s.prune_expired().unwrap(), 2);
        assert!(s.lookup("LIVE").unwrap().is_some());
        assert_eq!(s.prune_expired().unwrap(), 0);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let r = record("DURABLE", 3600);
        {
            let s = RedbStore::open(&path).unwrap();
            s.create(&r).unwrap();
        }
        let s = RedbStore::open(&path).unwrap();
        assert_eq!(s.lookup("DURABLE").unwrap(), Some(r));
    }

    #[test]
    fn concurrent_fetch_and_delete_has_one_winner() {
        let (s, _dir) = make_store();
        s.create(&record("RACE", 3600)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.fetch_and_delete("RACE").unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn decode_rejects_unknown_marker() {
        assert!(decode(&[0x7f, 0, 0]).is_err());
        assert!(decode(&[]).is_err());
    }
}
