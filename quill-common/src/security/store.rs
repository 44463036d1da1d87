//! Symmetric encryption of persisted payloads.
//!
//! Uses ChaCha20-Poly1305 authenticated encryption. Encrypted payloads are
//! wrapped in a self-describing envelope carrying the algorithm identifier
//! and base64-encoded nonce and ciphertext, never the key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Algorithm identifier written into every envelope.
pub const ENVELOPE_ALGORITHM: &str = "chacha20poly1305";

/// Self-describing wrapper around an encrypted payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Algorithm identifier (currently always `chacha20poly1305`)
    pub algorithm: String,
    /// Base64-encoded nonce
    pub nonce: String,
    /// Base64-encoded ciphertext
    pub ciphertext: String,
}

/// Sealed-payload encryptor/decryptor for a single symmetric key.
///
/// Key lifecycle (load, generate, derive) is the caller's concern.
pub struct SecureStore {
    cipher: ChaCha20Poly1305,
}

impl SecureStore {
    /// Create a store from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Encrypt a payload into an envelope with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Decryption("encryption failed".into()))?;

        Ok(Envelope {
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    /// Decrypt an envelope back into the plaintext payload.
    ///
    /// Fails with [`Error::Decryption`] on an unknown algorithm, a
    /// malformed envelope, or a wrong key - never returns corrupt data.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if envelope.algorithm != ENVELOPE_ALGORITHM {
            return Err(Error::Decryption(format!(
                "unsupported algorithm: {}",
                envelope.algorithm
            )));
        }

        let nonce_bytes = STANDARD
            .decode(&envelope.nonce)
            .map_err(|_| Error::Decryption("malformed nonce".into()))?;
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|_| Error::Decryption("malformed ciphertext".into()))?;

        if nonce_bytes.len() != 12 {
            return Err(Error::Decryption("bad nonce length".into()));
        }

        let nonce = Nonce::from_slice(&nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| Error::Decryption("wrong key or corrupted data".into()))
    }
}

/// Generate a random 32-byte key.
pub fn generate_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut *key);
    key
}

/// Derive a key from a passphrase and salt via SHA-256.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&digest);
    key
}

/// Parse a hex-encoded 32-byte key.
pub fn key_from_hex(encoded: &str) -> Result<Zeroizing<[u8; 32]>> {
    let bytes = hex::decode(encoded.trim())
        .map_err(|_| Error::Config("encryption key is not valid hex".into()))?;
    if bytes.len() != 32 {
        return Err(Error::Config(format!(
            "encryption key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_key();
        let store = SecureStore::new(&key);

        let envelope = store.seal(b"conversation payload").unwrap();
        assert_eq!(envelope.algorithm, ENVELOPE_ALGORITHM);

        let plaintext = store.open(&envelope).unwrap();
        assert_eq!(plaintext, b"conversation payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let store = SecureStore::new(&generate_key());
        let envelope = store.seal(b"secret").unwrap();

        let other = SecureStore::new(&generate_key());
        let err = other.open(&envelope).unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_key();
        let store = SecureStore::new(&key);
        let mut envelope = store.seal(b"secret").unwrap();

        let mut raw = STANDARD.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0xff;
        envelope.ciphertext = STANDARD.encode(raw);

        assert!(matches!(
            store.open(&envelope).unwrap_err(),
            Error::Decryption(_)
        ));
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let key = generate_key();
        let store = SecureStore::new(&key);
        let mut envelope = store.seal(b"secret").unwrap();
        envelope.algorithm = "rot13".into();

        assert!(matches!(
            store.open(&envelope).unwrap_err(),
            Error::Decryption(_)
        ));
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key("passphrase", b"salt");
        let b = derive_key("passphrase", b"salt");
        let c = derive_key("passphrase", b"other");
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_key_from_hex() {
        let key = generate_key();
        let encoded = hex::encode(*key);
        assert_eq!(*key_from_hex(&encoded).unwrap(), *key);

        assert!(key_from_hex("not-hex").is_err());
        assert!(key_from_hex("deadbeef").is_err());
    }
}
