//! Narrow seams over the concrete primitives so the lifecycle manager never
//! names PBKDF2 or ChaCha20-Poly1305 directly.

pub mod envelope;
pub mod kdf;

pub use envelope::{AuthenticationError, ChaChaEnvelope, CipherEnvelope};
pub use kdf::{Argon2id, DerivedKey, KdfAlgorithm, KeyDerivation, Pbkdf2Sha256};
