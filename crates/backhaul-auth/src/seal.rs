//! Payload sealing with the client's verify key
//!
//! Sealed layout: `[nonce: 12][ciphertext + tag]`, ChaCha20-Poly1305 keyed
//! with SHA-256 of the verify key.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{AuthError, AuthResult};

pub const NONCE_LEN: usize = 12;

fn cipher(verify_key: &[u8]) -> ChaCha20Poly1305 {
    let key = Sha256::digest(verify_key);
    ChaCha20Poly1305::new(Key::from_slice(&key))
}

pub fn seal(verify_key: &[u8], plaintext: &[u8]) -> AuthResult<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher(verify_key)
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| AuthError::SealFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open(verify_key: &[u8], sealed: &[u8]) -> AuthResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(AuthError::SealedTooShort(sealed.len()));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher(verify_key)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AuthError::OpenFailed)
}
