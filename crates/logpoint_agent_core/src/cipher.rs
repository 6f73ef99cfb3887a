//! Authenticated encryption and DEFLATE compression of message payloads.
//!
//! Pure functions; key material is validated once when the [`SecretKey`] is
//! built and never logged.

use std::fmt;
use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::{AgentError, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

#[derive(Clone)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            AgentError::config(format!(
                "Encryption key must be exactly {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| AgentError::config(format!("Encryption key is not valid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    fn aead(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Encrypts `plaintext` under a freshly generated nonce.
pub fn encrypt(plaintext: &[u8], key: &SecretKey) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = key
        .aead()
        .encrypt(&nonce, plaintext)
        .map_err(|e| AgentError::Crypto(e.to_string()))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&nonce);
    Ok((nonce_bytes, ciphertext))
}

/// Fails with [`AgentError::Decryption`] when the tag does not verify.
pub fn decrypt(nonce: &[u8], ciphertext: &[u8], key: &SecretKey) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(AgentError::Decryption);
    }
    key.aead()
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| AgentError::Decryption)
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AgentError::Decompression(e.to_string()))?;
    Ok(out)
}
