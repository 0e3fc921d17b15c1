pub mod db;
pub mod memory;
pub mod model;

use std::sync::Arc;
use std::time::Duration;

use tokio::{task::JoinHandle, time};
use tracing::{info, warn};

use crate::error::Result;

pub use db::RedbStore;
pub use memory::MemoryStore;
pub use model::SecretRecord;

/// Keyed persistence with expiry, as consumed by the lifecycle manager.
///
/// Every method treats a record whose expiration has passed as absent, even
/// before the sweep physically removes it.
pub trait SecretStore: Send + Sync + 'static {
    /// Insert a new record. Fails with `SecretError::Conflict` if the key is
    /// taken. All-or-nothing.
    fn create(&self, record: &SecretRecord) -> Result<()>;

    fn lookup(&self, secret_key: &str) -> Result<Option<SecretRecord>>;

    /// Remove a record. Deleting an absent key is not an error.
    fn delete(&self, secret_key: &str) -> Result<()>;

    /// Remove and return a record in one indivisible step. Of any number of
    /// concurrent callers on the same key, at most one receives `Some`.
    fn fetch_and_delete(&self, secret_key: &str) -> Result<Option<SecretRecord>>;

    /// Physically remove every expired record. Returns how many were removed.
    fn prune_expired(&self) -> Result<usize>;

    /// Spawn a background Tokio task that calls `prune_expired()` every `interval`.
    fn spawn_sweep(self: Arc<Self>, interval: Duration) -> JoinHandle<()>
    where
        Self: Sized,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let store = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || store.prune_expired()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(removed)) => info!(removed, "swept expired secrets"),
                    Ok(Err(e)) => warn!(error = %e, "expiry sweep error"),
                    Err(e) => warn!(error = %e, "expiry sweep task failed"),
                }
            }
        })
    }
}
