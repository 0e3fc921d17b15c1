use thiserror::Error;

/// Outcome taxonomy of the secret lifecycle.
///
/// `NotFound` and `InvalidPassphrase` are expected, quiet outcomes the gateway
/// maps to stable responses. The remaining variants are infrastructure
/// failures and must never leak internal detail to the caller.
#[derive(Debug, Error)]
pub enum SecretError {
    /// Key absent, already consumed, or expired.
    #[error("secret not found")]
    NotFound,

    /// Decryption failed: wrong passphrase or corrupted ciphertext.
    #[error("invalid passphrase")]
    InvalidPassphrase,

    /// Opaque-key collision on create.
    #[error("secret key already exists")]
    Conflict,

    /// Persistence engine failed or is unreachable.
    #[error("store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),

    /// Key derivation, encryption or worker failure.
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl SecretError {
    pub(crate) fn store(e: impl Into<anyhow::Error>) -> Self {
        Self::StoreUnavailable(e.into())
    }

    pub(crate) fn internal(e: impl Into<anyhow::Error>) -> Self {
        Self::Internal(e.into())
    }
}

pub type Result<T, E = SecretError> = std::result::Result<T, E>;
