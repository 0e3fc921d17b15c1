use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use super::kdf::DerivedKey;

/// Leading byte of every token; bumped if the layout ever changes.
const TOKEN_VERSION: u8 = 0x01;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Wrong key, tampered token and malformed token all surface as this one
/// error so a caller cannot tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("authentication failed")]
pub struct AuthenticationError;

/// Authenticated encryption into a self-contained text token.
pub trait CipherEnvelope: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &DerivedKey) -> Result<String>;

    fn decrypt(&self, token: &str, key: &DerivedKey) -> Result<Vec<u8>, AuthenticationError>;
}

/// ChaCha20-Poly1305 envelope.
///
/// Token layout before base64url (no padding):
/// `[version: 1][nonce: 12][ciphertext || tag]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaEnvelope;

impl CipherEnvelope for ChaChaEnvelope {
    fn encrypt(&self, plaintext: &[u8], key: &DerivedKey) -> Result<String> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

        let mut raw = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        raw.push(TOKEN_VERSION);
        raw.extend_from_slice(&nonce_bytes);
        raw.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn decrypt(&self, token: &str, key: &DerivedKey) -> Result<Vec<u8>, AuthenticationError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| AuthenticationError)?;
        if raw.len() < 1 + NONCE_LEN + TAG_LEN || raw[0] != TOKEN_VERSION {
            return Err(AuthenticationError);
        }

        let (nonce_bytes, ciphertext) = raw[1..].split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AuthenticationError)
    }
}
