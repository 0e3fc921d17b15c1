//! Passphrase-based key derivation.
//!
//! Both implementations are deliberately slow so every passphrase guess
//! costs real CPU time. The salt is the server-wide value from config,
//! optionally extended with a per-record salt by the lifecycle manager.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

/// Minimum PBKDF2 rounds accepted from configuration.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

const KEY_LEN: usize = 32;

/// 32-byte symmetric key derived from a passphrase. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Turns a passphrase plus salt into a fixed-length key.
///
/// Implementations must be deterministic: the same inputs always yield the
/// same key.
pub trait KeyDerivation: Send + Sync {
    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<DerivedKey>;
}

/// PBKDF2-HMAC-SHA256.
#[derive(Debug, Clone, Copy)]
pub struct Pbkdf2Sha256 {
    iterations: u32,
}

impl Pbkdf2Sha256 {
    pub fn new(iterations: u32) -> Self {
        Self { iterations }
    }
}

impl Default for Pbkdf2Sha256 {
    fn default() -> Self {
        Self::new(MIN_PBKDF2_ITERATIONS)
    }
}

impl KeyDerivation for Pbkdf2Sha256 {
    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<DerivedKey> {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, self.iterations, &mut key);
        Ok(DerivedKey(key))
    }
}

/// Argon2id with 64 MiB memory, 3 passes, 1 lane.
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2id;

impl KeyDerivation for Argon2id {
    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<DerivedKey> {
        let params = Params::new(
            65536, // m_cost: 64 MiB
            3,     // t_cost
            1,     // p_cost
            Some(KEY_LEN),
        )
        .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(passphrase, salt, &mut key)
            .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;
        Ok(DerivedKey(key))
    }
}

/// Selectable derivation algorithm (`BURNBOX_KDF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KdfAlgorithm {
    #[default]
    Pbkdf2,
    Argon2id,
}

impl KdfAlgorithm {
    pub fn build(self, pbkdf2_iterations: u32) -> Arc<dyn KeyDerivation> {
        match self {
            Self::Pbkdf2 => Arc::new(Pbkdf2Sha256::new(pbkdf2_iterations)),
            Self::Argon2id => Arc::new(Argon2id),
        }
    }
}

impl FromStr for KdfAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pbkdf2" | "pbkdf2-sha256" => Ok(Self::Pbkdf2),
            "argon2" | "argon2id" => Ok(Self::Argon2id),
            other => anyhow::bail!("unknown key derivation algorithm: {other}"),
        }
    }
}
