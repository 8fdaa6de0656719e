//! Message payload encryption
//!
//! AES-256-GCM over message bodies with a pre-shared key. The wire form of
//! an encrypted body is `base64(nonce ‖ ciphertext ‖ tag)` with a fresh
//! 96-bit random nonce per message.
//!
//! Key material comes from a pluggable [`KeySource`] and is materialized at
//! most once into an [`EncryptionKey`] handle that the codec shares by `Arc`.

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::error::ChatError;

/// Nonce length in bytes (96 bits)
pub const NONCE_LEN: usize = 12;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// Provider of raw symmetric key material
///
/// Consulted once per [`EncryptionKey`]; a negotiated per-session scheme
/// can replace the pre-shared secret without touching the codec.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn load_key(&self) -> Result<Vec<u8>, ChatError>;
}

/// Pre-shared secret supplied as base64 through configuration
#[derive(Clone)]
pub struct SharedSecret {
    encoded: String,
}

impl SharedSecret {
    pub fn from_base64(encoded: impl Into<String>) -> Self {
        Self {
            encoded: encoded.into(),
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Self {
        Self {
            encoded: STANDARD.encode(raw),
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

#[async_trait]
impl KeySource for SharedSecret {
    async fn load_key(&self) -> Result<Vec<u8>, ChatError> {
        let raw = STANDARD
            .decode(self.encoded.trim())
            .map_err(|e| ChatError::KeyMaterial(format!("secret is not base64: {}", e)))?;
        if raw.len() != KEY_LEN {
            return Err(ChatError::KeyMaterial(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                raw.len()
            )));
        }
        Ok(raw)
    }
}

/// Once-initialized key handle
///
/// The cipher is built from the source on first use and reused for the
/// lifetime of the handle. Read-only afterwards.
pub struct EncryptionKey {
    source: Box<dyn KeySource>,
    cipher: OnceCell<Aes256Gcm>,
}

impl EncryptionKey {
    pub fn new(source: impl KeySource + 'static) -> Self {
        Self {
            source: Box::new(source),
            cipher: OnceCell::new(),
        }
    }

    /// Whether the key material has been loaded yet
    pub fn is_materialized(&self) -> bool {
        self.cipher.initialized()
    }

    async fn cipher(&self) -> Result<&Aes256Gcm, ChatError> {
        self.cipher
            .get_or_try_init(|| async {
                let raw = self.source.load_key().await?;
                let cipher = Aes256Gcm::new_from_slice(&raw).map_err(|_| {
                    ChatError::KeyMaterial(format!("expected {} bytes, got {}", KEY_LEN, raw.len()))
                })?;
                debug!("Message key materialized");
                Ok::<_, ChatError>(cipher)
            })
            .await
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

/// Encrypts outbound bodies and decrypts inbound ones
#[derive(Debug, Clone)]
pub struct EncryptionCodec {
    key: Arc<EncryptionKey>,
}

impl EncryptionCodec {
    pub fn new(key: Arc<EncryptionKey>) -> Self {
        Self { key }
    }

    /// Codec over a pre-shared base64 secret
    pub fn from_secret(secret: SharedSecret) -> Self {
        Self::new(Arc::new(EncryptionKey::new(secret)))
    }

    pub fn key(&self) -> &Arc<EncryptionKey> {
        &self.key
    }

    /// Encrypt a plaintext body into its transportable form
    pub async fn encrypt(&self, plaintext: &str) -> Result<String, ChatError> {
        let cipher = self.key.cipher().await?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| ChatError::Encryption)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    /// Decrypt an inbound body, passing non-ciphertext through unchanged
    ///
    /// Any failure (not base64, too short, bad tag, wrong key, not UTF-8)
    /// yields the input as-is so peers that send plaintext stay readable.
    /// This is a compatibility behavior and NOT an integrity check: a
    /// forged or foreign payload is shown as plaintext rather than rejected.
    pub async fn decrypt(&self, blob: &str) -> String {
        match self.try_decrypt(blob).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                trace!("Payload passed through undecrypted: {}", e);
                blob.to_string()
            }
        }
    }

    /// Strict decryption
    pub async fn try_decrypt(&self, blob: &str) -> Result<String, ChatError> {
        let combined = STANDARD.decode(blob)?;
        if combined.len() < NONCE_LEN {
            return Err(ChatError::Decryption("payload shorter than nonce".to_string()));
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = self.key.cipher().await?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ChatError::Decryption("authentication failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| ChatError::Decryption("plaintext is not UTF-8".to_string()))
    }
}
