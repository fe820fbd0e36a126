//! Shared-key payload encryption
//!
//! Clients may wrap payloads in `{"_type":"encrypted","data":...}` where
//! `data` is `base64(nonce || secretbox(message))` using XSalsa20-Poly1305.
//!
//! The key is the UTF-8 secret text zero-padded (or truncated) to 32 bytes.
//! This is not a KDF and is weak for short secrets; it is kept as-is because
//! the clients derive the key the same way.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crypto_secretbox::aead::{Aead, AeadCore, KeyInit, OsRng};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};

use crate::utils::error::{DecryptError, EncryptError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Zero-pad or truncate `secret` to the 32-byte symmetric key.
pub fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let bytes = secret.as_bytes();
    let len = bytes.len().min(KEY_LEN);
    key[..len].copy_from_slice(&bytes[..len]);
    key
}

fn cipher(secret: &str) -> XSalsa20Poly1305 {
    let key = derive_key(secret);
    XSalsa20Poly1305::new(Key::from_slice(&key))
}

/// Encrypt `message` under a fresh random nonce and return the base64 text
/// carried in the envelope's `data` field.
pub fn encrypt(secret: &str, message: &[u8]) -> Result<String, EncryptError> {
    let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);
    let sealed = cipher(secret)
        .encrypt(&nonce, message)
        .map_err(|_| EncryptError::Seal)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&sealed);
    Ok(STANDARD.encode(out))
}

/// Open a base64 `nonce || ciphertext` blob. Wrong keys, tampering and
/// truncation all come back as a `DecryptError`, never as garbage plaintext.
pub fn decrypt(secret: &str, data: &str) -> Result<Vec<u8>, DecryptError> {
    let raw = STANDARD.decode(data.trim())?;
    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(DecryptError::Truncated);
    }
    let (nonce, sealed) = raw.split_at(NONCE_LEN);
    cipher(secret)
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| DecryptError::Authentication)
}
