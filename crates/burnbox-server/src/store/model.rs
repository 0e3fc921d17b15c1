use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Length of the optional per-record salt.
pub const RECORD_SALT_LEN: usize = 16;

/// One stored secret. Immutable once created: read, then removed.
///
/// All fields except `secret` are plaintext so the sweep can evict without
/// decrypting anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Opaque retrieval key (UUIDv4).
    pub secret_key: String,
    /// Envelope token (base64url AEAD ciphertext).
    pub secret: String,
    /// Unix timestamp (seconds, UTC) at which the record stops being readable.
    pub expiration: i64,
    /// Unix timestamp (seconds, UTC) of creation.
    pub created_at: i64,
    /// Per-record salt appended to the server salt, when enabled.
    #[serde(default)]
    pub salt: Option<[u8; RECORD_SALT_LEN]>,
}

impl SecretRecord {
    /// True once `now` has reached the expiration instant.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expiration
    }
}

/// Current wall-clock time as Unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
