//! Crypto envelope and key derivation.
//!
//! The envelope is encrypt-then-MAC: AES-256-CBC under the session
//! encryption key, HMAC-SHA-256 over IV, ciphertext, and the associated
//! header bytes under the session MAC key. Both keys derive from the shared
//! secret via PBKDF2-HMAC-SHA-256 with a per-session salt exchanged in INIT.

mod envelope;
mod keys;

pub use envelope::{open, seal, EnvelopeLen, IV_LEN, MAC_LEN};
pub use keys::{generate_salt, SessionKeys, KEY_LEN, SALT_LEN};

use thiserror::Error;

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Envelope shorter than IV plus MAC.
    #[error("envelope too short: {0} bytes")]
    EnvelopeTooShort(usize),

    /// HMAC verification failed; the frame must be dropped.
    #[error("MAC verification failed")]
    MacMismatch,

    /// Decryption failed (corrupt padding despite a valid MAC).
    #[error("decryption failed")]
    DecryptFailed,
}
