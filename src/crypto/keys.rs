//! Session key derivation.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Per-session salt length (128-bit).
pub const SALT_LEN: usize = 16;

/// Length of each derived key (256-bit).
pub const KEY_LEN: usize = 32;

/// Fixed label salt for the handshake key that authenticates INIT, before
/// the per-session salt is known.
const HANDSHAKE_LABEL: &[u8] = b"peercrypt/handshake/v1";

/// Encryption and MAC keys for one session.
///
/// Both keys come from a single PBKDF2 expansion of the shared secret and
/// are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    enc: [u8; KEY_LEN],
    mac: [u8; KEY_LEN],
}

impl SessionKeys {
    /// Derive session keys from a shared secret and salt.
    pub fn derive(secret: &[u8], salt: &[u8], iterations: u32) -> Self {
        let mut okm = [0u8; KEY_LEN * 2];
        pbkdf2_hmac::<Sha256>(secret, salt, iterations.max(1), &mut okm);
        let mut enc = [0u8; KEY_LEN];
        let mut mac = [0u8; KEY_LEN];
        enc.copy_from_slice(&okm[..KEY_LEN]);
        mac.copy_from_slice(&okm[KEY_LEN..]);
        okm.zeroize();
        Self { enc, mac }
    }

    /// Derive the handshake keys that authenticate INIT and ACK-of-INIT.
    pub fn handshake(secret: &[u8], iterations: u32) -> Self {
        Self::derive(secret, HANDSHAKE_LABEL, iterations)
    }

    /// AES-256 encryption key.
    pub fn enc_key(&self) -> &[u8; KEY_LEN] {
        &self.enc
    }

    /// HMAC-SHA-256 key, also used for the frame authentication token.
    pub fn mac_key(&self) -> &[u8; KEY_LEN] {
        &self.mac
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Generate a random per-session salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    rand::random()
}
