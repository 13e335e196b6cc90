//! Authenticated encryption of chunk and control payloads.
//!
//! Envelope layout: `IV(16) || AES-256-CBC ciphertext || HMAC-SHA-256(32)`.
//! The MAC covers IV, ciphertext, and the caller-supplied associated header
//! bytes, in that order (encrypt-then-MAC).

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{CryptoError, SessionKeys};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// CBC initialization vector length (128-bit).
pub const IV_LEN: usize = 16;

/// Appended MAC length (256-bit).
pub const MAC_LEN: usize = 32;

/// Envelope size arithmetic for window accounting.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeLen;

impl EnvelopeLen {
    /// Sealed length for a plaintext of `len` bytes (PKCS#7 pads up to the
    /// next block boundary).
    pub fn sealed(len: usize) -> usize {
        let padded = (len / 16 + 1) * 16;
        IV_LEN + padded + MAC_LEN
    }
}

/// Seal a payload: encrypt under the session encryption key, then MAC over
/// IV, ciphertext, and `header`.
pub fn seal(keys: &SessionKeys, header: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let iv: [u8; IV_LEN] = rand::random();
    let ciphertext = Aes256CbcEnc::new(keys.enc_key().into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);

    let mut mac = HmacSha256::new_from_slice(keys.mac_key()).expect("hmac accepts any key length");
    mac.update(&out);
    mac.update(header);
    out.extend_from_slice(&mac.finalize().into_bytes());
    out
}

/// Open an envelope: verify the MAC, then decrypt.
///
/// A MAC failure means the frame must be dropped without further
/// processing; callers count these toward the session's MAC-failure
/// threshold.
pub fn open(keys: &SessionKeys, header: &[u8], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < IV_LEN + MAC_LEN {
        return Err(CryptoError::EnvelopeTooShort(envelope.len()));
    }
    let (body, tag) = envelope.split_at(envelope.len() - MAC_LEN);

    let mut mac = HmacSha256::new_from_slice(keys.mac_key()).expect("hmac accepts any key length");
    mac.update(body);
    mac.update(header);
    mac.verify_slice(tag).map_err(|_| CryptoError::MacMismatch)?;

    let (iv, ciphertext) = body.split_at(IV_LEN);
    Aes256CbcDec::new_from_slices(keys.enc_key(), iv)
        .map_err(|_| CryptoError::DecryptFailed)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}
