// Per-session symmetric encryption: XChaCha20-Poly1305
//
// The core receives an opaque 32-byte shared key per session (key agreement
// happens outside, in the wallet layer). Flow per message:
// 1. KDF: Blake3::derive_key(shared_key ‖ session_id) → session subkey
// 2. Encrypt: XChaCha20-Poly1305(subkey, random 24-byte nonce, plaintext)
//    with the session id bound as AAD
// 3. Output: nonce ‖ ciphertext
//
// Decryption splits the nonce back off and reverses. A ciphertext moved to a
// different session fails authentication via the AAD binding.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use thiserror::Error;
use zeroize::Zeroize;

/// KDF context string for deriving session subkeys.
/// Changing this breaks compatibility with all existing sessions.
const KDF_CONTEXT: &str = "solconnect-core v1 session encryption 2026-06-01";

/// XChaCha20 nonce length, prepended to every ciphertext
const NONCE_LEN: usize = 24;

#[derive(Debug, Error, Clone)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("No key registered for session {0}")]
    UnknownSession(String),
}

/// Payload encryption capability. The rest of the core treats ciphertext as
/// opaque bytes; tests inject a fake.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, session_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, session_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Key ring + AEAD over the sessions this core participates in
pub struct SessionCipher {
    keys: RwLock<HashMap<String, [u8; 32]>>,
}

impl SessionCipher {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Register the shared key for a session. The stored subkey is already
    /// domain-separated; the caller should zeroize its own copy.
    pub fn register_session(&self, session_id: &str, shared_key: &[u8; 32]) {
        let mut material = Vec::with_capacity(32 + session_id.len());
        material.extend_from_slice(shared_key);
        material.extend_from_slice(session_id.as_bytes());
        let subkey = blake3::derive_key(KDF_CONTEXT, &material);
        material.zeroize();

        self.keys.write().insert(session_id.to_string(), subkey);
    }

    /// Drop a session's key (end-session). Zeroizes the stored subkey.
    pub fn remove_session(&self, session_id: &str) {
        if let Some(mut key) = self.keys.write().remove(session_id) {
            key.zeroize();
        }
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.keys.read().contains_key(session_id)
    }

    fn subkey(&self, session_id: &str) -> Result<[u8; 32], CryptoError> {
        self.keys
            .read()
            .get(session_id)
            .copied()
            .ok_or_else(|| CryptoError::UnknownSession(session_id.to_string()))
    }
}

impl Default for SessionCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionCipher {
    fn drop(&mut self) {
        for (_, key) in self.keys.write().iter_mut() {
            key.zeroize();
        }
    }
}

impl Cipher for SessionCipher {
    fn encrypt(&self, session_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut subkey = self.subkey(session_id)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&subkey)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        subkey.zeroize();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: session_id.as_bytes(),
                },
            )
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, session_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt("ciphertext too short".to_string()));
        }

        let mut subkey = self.subkey(session_id)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&subkey)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        subkey.zeroize();

        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: body,
                    aad: session_id.as_bytes(),
                },
            )
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}
