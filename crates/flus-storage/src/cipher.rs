use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use flus_core::{AccessCredential, SealedCredential};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ENVELOPE_VERSION: &str = "v1";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault key must decode to 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("vault key is not valid base64: {0}")]
    KeyEncoding(#[from] base64::DecodeError),
    #[error("vault key id must be non-empty and free of ':'")]
    InvalidKeyId,
    #[error("credential envelope is malformed")]
    Malformed,
    #[error("credential was sealed with key {0}, which is not loaded")]
    UnknownKey(String),
    #[error("credential ciphertext failed authentication")]
    Authentication,
    #[error("credential encryption failed")]
    Encryption,
}

/// Authenticated encryption for access credentials (ChaCha20-Poly1305).
///
/// Envelope: `v1:<key_id>:<nonce>:<ciphertext>`, base64url without padding.
/// The item id is bound as associated data, so an envelope copied onto
/// another item fails to open. One key is loaded per process; the key id in
/// the envelope is where rotation would hook in.
pub struct VaultCipher {
    key_id: String,
    aead: ChaCha20Poly1305,
}

impl fmt::Debug for VaultCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultCipher")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl VaultCipher {
    pub fn new(key: [u8; 32], key_id: Option<String>) -> Result<Self, VaultError> {
        let key_id = key_id.unwrap_or_else(|| Self::fingerprint(&key));
        if key_id.is_empty() || key_id.contains(':') {
            return Err(VaultError::InvalidKeyId);
        }
        Ok(Self {
            key_id,
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// Accepts standard or url-safe base64.
    pub fn from_base64(encoded: &str, key_id: Option<String>) -> Result<Self, VaultError> {
        let trimmed = encoded.trim();
        let bytes = URL_SAFE_NO_PAD
            .decode(trimmed.as_bytes())
            .or_else(|_| STANDARD.decode(trimmed.as_bytes()))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::KeyLength(bytes.len()))?;
        Self::new(key, key_id)
    }

    /// Short sha256 fingerprint used as the default key id.
    pub fn fingerprint(key: &[u8]) -> String {
        let digest = hex::encode(Sha256::digest(key));
        digest[..12].to_string()
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn seal(
        &self,
        item_id: &str,
        credential: &AccessCredential,
    ) -> Result<SealedCredential, VaultError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(
                &nonce,
                Payload {
                    msg: credential.expose().as_bytes(),
                    aad: item_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Encryption)?;
        Ok(SealedCredential::from_envelope(format!(
            "{ENVELOPE_VERSION}:{}:{}:{}",
            self.key_id,
            URL_SAFE_NO_PAD.encode(nonce.as_slice()),
            URL_SAFE_NO_PAD.encode(ciphertext)
        )))
    }

    pub fn open(
        &self,
        item_id: &str,
        sealed: &SealedCredential,
    ) -> Result<AccessCredential, VaultError> {
        let mut parts = sealed.envelope().split(':');
        let (Some(version), Some(key_id), Some(nonce_b64), Some(ciphertext_b64), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(VaultError::Malformed);
        };
        if version != ENVELOPE_VERSION {
            return Err(VaultError::Malformed);
        }
        if key_id != self.key_id {
            return Err(VaultError::UnknownKey(key_id.to_string()));
        }

        let nonce_raw = URL_SAFE_NO_PAD
            .decode(nonce_b64.as_bytes())
            .map_err(|_| VaultError::Malformed)?;
        if nonce_raw.len() != NONCE_LEN {
            return Err(VaultError::Malformed);
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64.as_bytes())
            .map_err(|_| VaultError::Malformed)?;

        let plaintext = self
            .aead
            .decrypt(
                Nonce::from_slice(&nonce_raw),
                Payload {
                    msg: &ciphertext,
                    aad: item_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Authentication)?;
        let secret = String::from_utf8(plaintext).map_err(|_| VaultError::Malformed)?;
        Ok(AccessCredential::new(secret))
    }
}
