//! Secret lifecycle: seal a plaintext under a passphrase, disclose it once.
//!
//! The manager holds no mutable state of its own. Everything that changes
//! lives in the [`SecretStore`], and the single-disclosure guarantee rests on
//! the store's atomic `fetch_and_delete`, not on any lock in this process, so
//! several server instances may share one store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypto::{ChaChaEnvelope, CipherEnvelope, KeyDerivation, Pbkdf2Sha256};
use crate::error::{Result, SecretError};
use crate::store::model::{unix_now, RECORD_SALT_LEN};
use crate::store::{SecretRecord, SecretStore};

/// Attempts at finding an unused opaque key before giving up.
pub const MAX_KEY_ATTEMPTS: u32 = 3;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Server-wide salt, loaded once at startup and never mutated.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Salt(Vec<u8>);

impl Salt {
    pub fn new(bytes: impl Into<Vec<u8>>) -> anyhow::Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            anyhow::bail!("salt must not be empty");
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({} bytes)", self.0.len())
    }
}

/// Orchestrates generate/get over a store, a KDF and an envelope.
#[derive(Clone)]
pub struct SecretManager {
    store: Arc<dyn SecretStore>,
    kdf: Arc<dyn KeyDerivation>,
    envelope: Arc<dyn CipherEnvelope>,
    salt: Arc<Salt>,
    ttl: Duration,
    per_secret_salt: bool,
    /// Bounds how many derivations run at once on the blocking pool.
    workers: Arc<Semaphore>,
}

impl SecretManager {
    /// PBKDF2 (100 000 rounds), ChaCha20-Poly1305, one-hour TTL, one derivation
    /// slot per CPU.
    pub fn new(store: Arc<dyn SecretStore>, salt: Salt) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            store,
            kdf: Arc::new(Pbkdf2Sha256::default()),
            envelope: Arc::new(ChaChaEnvelope),
            salt: Arc::new(salt),
            ttl: DEFAULT_TTL,
            per_secret_salt: false,
            workers: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn with_kdf(mut self, kdf: Arc<dyn KeyDerivation>) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_envelope(mut self, envelope: Arc<dyn CipherEnvelope>) -> Self {
        self.envelope = envelope;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Mix a random per-record salt into derivation for new secrets.
    /// Existing records keep whatever salting they were written with.
    pub fn with_per_secret_salt(mut self, enabled: bool) -> Self {
        self.per_secret_salt = enabled;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(workers.max(1)));
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Seal `plaintext` under `passphrase` and return a fresh opaque key.
    pub async fn generate_secret(&self, plaintext: &str, passphrase: &str) -> Result<String> {
        let record_salt = self.per_secret_salt.then(random_record_salt);
        let salt = self.salt_for(record_salt.as_ref());
        let plaintext = Zeroizing::new(plaintext.as_bytes().to_vec());
        let passphrase = Zeroizing::new(passphrase.as_bytes().to_vec());
        let kdf = Arc::clone(&self.kdf);
        let envelope = Arc::clone(&self.envelope);

        let token = self
            .offload(move || {
                let key = kdf.derive(&passphrase, &salt).map_err(SecretError::Internal)?;
                envelope
                    .encrypt(&plaintext, &key)
                    .map_err(SecretError::Internal)
            })
            .await?;

        let created_at = unix_now();
        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let expiration = created_at.saturating_add(ttl_secs);

        for attempt in 1..=MAX_KEY_ATTEMPTS {
            let secret_key = Uuid::new_v4().to_string();
            let record = SecretRecord {
                secret_key: secret_key.clone(),
                secret: token.clone(),
                expiration,
                created_at,
                salt: record_salt,
            };
            match self.with_store(move |s| s.create(&record)).await {
                Ok(()) => {
                    debug!(key = %secret_key, expiration, "generated secret");
                    return Ok(secret_key);
                }
                Err(SecretError::Conflict) => {
                    warn!(attempt, "opaque key collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(SecretError::Conflict)
    }

    /// Disclose the plaintext behind `secret_key` and consume the record.
    ///
    /// A wrong passphrase leaves the record in place. Of several callers
    /// racing with the right passphrase, only the one whose
    /// `fetch_and_delete` removed the record gets the plaintext; the others
    /// see `NotFound`.
    pub async fn get_secret(&self, secret_key: &str, passphrase: &str) -> Result<String> {
        let key = secret_key.to_owned();
        let record = self
            .with_store(move |s| s.lookup(&key))
            .await?
            .ok_or(SecretError::NotFound)?;

        let salt = self.salt_for(record.salt.as_ref());
        let passphrase = Zeroizing::new(passphrase.as_bytes().to_vec());
        let token = record.secret.clone();
        let kdf = Arc::clone(&self.kdf);
        let envelope = Arc::clone(&self.envelope);

        let plaintext = self
            .offload(move || {
                let key = kdf.derive(&passphrase, &salt).map_err(SecretError::Internal)?;
                envelope
                    .decrypt(&token, &key)
                    .map(Zeroizing::new)
                    .map_err(|_| SecretError::InvalidPassphrase)
            })
            .await;
        let plaintext = match plaintext {
            Err(SecretError::InvalidPassphrase) => {
                debug!(key = %secret_key, "passphrase rejected");
                return Err(SecretError::InvalidPassphrase);
            }
            other => other?,
        };

        let key = secret_key.to_owned();
        match self.with_store(move |s| s.fetch_and_delete(&key)).await? {
            Some(consumed) if consumed.secret == record.secret => {}
            _ => {
                debug!(key = %secret_key, "secret consumed by a concurrent reader");
                return Err(SecretError::NotFound);
            }
        }

        debug!(key = %secret_key, "secret disclosed and burned");
        std::str::from_utf8(&plaintext)
            .map(str::to_owned)
            .map_err(|e| SecretError::internal(anyhow::anyhow!("plaintext is not UTF-8: {e}")))
    }

    fn salt_for(&self, record_salt: Option<&[u8; RECORD_SALT_LEN]>) -> Zeroizing<Vec<u8>> {
        let mut salt = Zeroizing::new(self.salt.as_bytes().to_vec());
        if let Some(extra) = record_salt {
            salt.extend_from_slice(extra);
        }
        salt
    }

    /// Run CPU-bound crypto on the blocking pool. The worker permit lives in
    /// the blocking task, so it is held until the work finishes even if the
    /// caller is dropped.
    async fn offload<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(SecretError::internal)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(SecretError::internal)?
    }

    /// Run a (synchronous) store call on the blocking pool.
    async fn with_store<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&dyn SecretStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .map_err(SecretError::internal)?
    }
}

fn random_record_salt() -> [u8; RECORD_SALT_LEN] {
    let mut salt = [0u8; RECORD_SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::store::MemoryStore;

    fn manager_with(store: Arc<dyn SecretStore>) -> SecretManager {
        SecretManager::new(store, Salt::new("test-salt").unwrap())
            .with_kdf(Arc::new(Pbkdf2Sha256::new(1_000)))
    }

    fn manager() -> (SecretManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (manager_with(store.clone()), store)
    }

    #[tokio::test]
    async fn generate_then_get_then_gone() {
        let (m, _) = manager();
        let k1 = m.generate_secret("hello", "pw1").await.unwrap();
        assert_eq!(m.get_secret(&k1, "pw1").await.unwrap(), "hello");
        assert!(matches!(
            m.get_secret(&k1, "pw1").await,
            Err(SecretError::NotFound)
        ));
        assert!(matches!(
            m.get_secret(&k1, "other").await,
            Err(SecretError::NotFound)
        ));
    }

    #[tokio::test]
    async fn wrong_passphrase_preserves_record() {
        let (m, store) = manager();
        let k2 = m.generate_secret("x", "correct").await.unwrap();
        for _ in 0..3 {
            assert!(matches!(
                m.get_secret(&k2, "wrong").await,
                Err(SecretError::InvalidPassphrase)
            ));
        }
        assert_eq!(store.len(), 1);
        assert_eq!(m.get_secret(&k2, "correct").await.unwrap(), "x");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn expired_secret_is_not_found() {
        let (m, _) = manager();
        let m = m.with_ttl(Duration::ZERO);
        let k3 = m.generate_secret("y", "pw").await.unwrap();
        assert!(matches!(
            m.get_secret(&k3, "pw").await,
            Err(SecretError::NotFound)
        ));
    }

    #[tokio::test]
    async fn huge_ttl_saturates_instead_of_expiring() {
        let (m, store) = manager();
        let m = m.with_ttl(Duration::from_secs(u64::MAX));
        let key = m.generate_secret("forever", "pw").await.unwrap();
        assert_eq!(store.lookup(&key).unwrap().unwrap().expiration, i64::MAX);
        assert_eq!(m.get_secret(&key, "pw").await.unwrap(), "forever");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_callers_keep_worker_slot_until_work_ends() {
        let (m, _) = manager();
        let m = m.with_workers(1);
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let m = m.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let task = tokio::spawn(async move {
                m.offload(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(300));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            });
            tokio::time::sleep(Duration::from_millis(30)).await;
            task.abort();
        }

        // Let the detached blocking jobs drain.
        for _ in 0..100 {
            if running.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let (m, _) = manager();
        assert!(matches!(
            m.get_secret("nonexistent-key", "anything").await,
            Err(SecretError::NotFound)
        ));
    }

    #[tokio::test]
    async fn record_carries_ttl_and_no_plaintext() {
        let (m, store) = manager();
        let key = m.generate_secret("top secret", "pw").await.unwrap();
        let record = store.lookup(&key).unwrap().unwrap();
        assert_eq!(record.expiration - record.created_at, 3600);
        assert!(!record.secret.contains("top secret"));
        assert!(record.salt.is_none());
        assert!(Uuid::parse_str(&key).is_ok());
    }

    #[tokio::test]
    async fn round_trips_unicode_and_empty() {
        let (m, _) = manager();
        for plaintext in ["", "ключ 🔑 clé", "line1\nline2\t\0"] {
            let key = m.generate_secret(plaintext, "pässwörd").await.unwrap();
            assert_eq!(m.get_secret(&key, "pässwörd").await.unwrap(), plaintext);
        }
    }

    #[tokio::test]
    async fn opaque_keys_are_unique() {
        let (m, _) = manager();
        let m = m.with_kdf(Arc::new(Pbkdf2Sha256::new(1)));
        let mut keys = HashSet::new();
        for i in 0..500 {
            let key = m.generate_secret(&i.to_string(), "pw").await.unwrap();
            assert!(keys.insert(key));
        }
    }

    #[tokio::test]
    async fn per_secret_salt_round_trips_and_coexists() {
        let (plain, store) = manager();
        let salted = plain.clone().with_per_secret_salt(true);

        let old = plain.generate_secret("legacy", "pw").await.unwrap();
        let new = salted.generate_secret("fresh", "pw").await.unwrap();
        assert!(store.lookup(&new).unwrap().unwrap().salt.is_some());

        assert_eq!(salted.get_secret(&old, "pw").await.unwrap(), "legacy");
        assert_eq!(plain.get_secret(&new, "pw").await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn different_server_salt_cannot_decrypt() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let a = manager_with(store.clone());
        let b = SecretManager::new(store.clone(), Salt::new("other-salt").unwrap())
            .with_kdf(Arc::new(Pbkdf2Sha256::new(1_000)));
        let key = a.generate_secret("s", "pw").await.unwrap();
        assert!(matches!(
            b.get_secret(&key, "pw").await,
            Err(SecretError::InvalidPassphrase)
        ));
        assert_eq!(a.get_secret(&key, "pw").await.unwrap(), "s");
    }

    #[tokio::test]
    async fn tampered_ciphertext_looks_like_wrong_passphrase() {
        let (m, store) = manager();
        let key = m.generate_secret("payload", "pw").await.unwrap();
        let mut record = store.fetch_and_delete(&key).unwrap().unwrap();
        let replacement = if record.secret.as_bytes()[10] == b'A' { "B" } else { "A" };
        record.secret.replace_range(10..11, replacement);
        store.create(&record).unwrap();

        assert!(matches!(
            m.get_secret(&key, "pw").await,
            Err(SecretError::InvalidPassphrase)
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_disclose_once() {
        let (m, _) = manager();
        let key = m.generate_secret("only once", "pw").await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let m = m.clone();
                let key = key.clone();
                tokio::spawn(async move { m.get_secret(&key, "pw").await })
            })
            .collect();

        let mut disclosed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(plaintext) => {
                    assert_eq!(plaintext, "only once");
                    disclosed += 1;
                }
                Err(SecretError::NotFound) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(disclosed, 1);
    }

    /// Reports `Conflict` for the first `collisions` creates.
    struct CollidingStore {
        inner: MemoryStore,
        collisions: u32,
        attempts: AtomicU32,
    }

    impl SecretStore for CollidingStore {
        fn create(&self, record: &SecretRecord) -> Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.collisions {
                return Err(SecretError::Conflict);
            }
            self.inner.create(record)
        }
        fn lookup(&self, secret_key: &str) -> Result<Option<SecretRecord>> {
            self.inner.lookup(secret_key)
        }
        fn delete(&self, secret_key: &str) -> Result<()> {
            self.inner.delete(secret_key)
        }
        fn fetch_and_delete(&self, secret_key: &str) -> Result<Option<SecretRecord>> {
            self.inner.fetch_and_delete(secret_key)
        }
        fn prune_expired(&self) -> Result<usize> {
            self.inner.prune_expired()
        }
    }

    #[tokio::test]
    async fn key_collision_is_retried() {
        let store = Arc::new(CollidingStore {
            inner: MemoryStore::new(),
            collisions: MAX_KEY_ATTEMPTS - 1,
            attempts: AtomicU32::new(0),
        });
        let m = manager_with(store.clone());
        let key = m.generate_secret("retry", "pw").await.unwrap();
        assert_eq!(store.attempts.load(Ordering::SeqCst), MAX_KEY_ATTEMPTS);
        assert_eq!(m.get_secret(&key, "pw").await.unwrap(), "retry");
    }

    #[tokio::test]
    async fn exhausted_collisions_surface_conflict() {
        let store = Arc::new(CollidingStore {
            inner: MemoryStore::new(),
            collisions: u32::MAX,
            attempts: AtomicU32::new(0),
        });
        let m = manager_with(store.clone());
        assert!(matches!(
            m.generate_secret("never", "pw").await,
            Err(SecretError::Conflict)
        ));
        assert!(store.inner.is_empty());
    }

    struct DownStore;

    impl SecretStore for DownStore {
        fn create(&self, _: &SecretRecord) -> Result<()> {
            Err(SecretError::store(anyhow::anyhow!("connection refused")))
        }
        fn lookup(&self, _: &str) -> Result<Option<SecretRecord>> {
            Err(SecretError::store(anyhow::anyhow!("connection refused")))
        }
        fn delete(&self, _: &str) -> Result<()> {
            Err(SecretError::store(anyhow::anyhow!("connection refused")))
        }
        fn fetch_and_delete(&self, _: &str) -> Result<Option<SecretRecord>> {
            Err(SecretError::store(anyhow::anyhow!("connection refused")))
        }
        fn prune_expired(&self) -> Result<usize> {
            Err(SecretError::store(anyhow::anyhow!("connection refused")))
        }
    }

    #[tokio::test]
    async fn store_outage_is_surfaced() {
        let m = manager_with(Arc::new(DownStore));
        assert!(matches!(
            m.generate_secret("s", "pw").await,
            Err(SecretError::StoreUnavailable(_))
        ));
        assert!(matches!(
            m.get_secret("k", "pw").await,
            Err(SecretError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn empty_salt_is_rejected() {
        assert!(Salt::new("").is_err());
        assert_eq!(format!("{:?}", Salt::new("abc").unwrap()), "Salt(3 bytes)");
    }
}
