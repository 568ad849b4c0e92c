//! Audit event encryption
//!
//! Sensitive audit events are encrypted as a whole before they leave the
//! process. Keys are identified by string IDs; rotation keeps retired keys
//! usable for decryption until their grace period runs out.

use crate::error::{AuditError, Result};
use crate::types::AuditEvent;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

/// Encrypted envelope for one audit event
///
/// Only the audit ID travels in plaintext, for correlation and indexing. The
/// ID is also bound into the ciphertext as associated data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedAuditEvent {
    pub original_audit_id: String,

    /// Identifies which key was used for encryption
    pub key_id: String,

    /// Base64-encoded nonce (96-bit for AES-256-GCM)
    pub nonce: String,

    /// Ciphertext and tag, base64 on the wire
    #[serde(with = "base64_bytes")]
    pub encrypted_data: Vec<u8>,

    pub encrypted_at: DateTime<Utc>,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Trait for encrypting and decrypting audit events
pub trait AuditEncryptor: Send + Sync {
    /// Encrypt an event with the active key
    fn encrypt(&self, event: &AuditEvent) -> Result<EncryptedAuditEvent>;

    /// Decrypt an envelope with whichever registered key produced it
    fn decrypt(&self, encrypted: &EncryptedAuditEvent) -> Result<AuditEvent>;

    /// The current active key ID used for encryption
    fn active_key_id(&self) -> String;
}

/// 256-bit key material handed out by a secret provider
#[derive(Clone)]
pub struct KeyMaterial {
    pub key_id: String,
    pub key: [u8; 32],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// External secret provider supplying encryption keys
pub trait KeyProvider: Send + Sync {
    /// The key currently designated for encryption
    fn current_key(&self) -> Result<KeyMaterial>;

    /// Rotate at the provider and return the newly active key
    fn next_key(&self) -> Result<KeyMaterial>;
}

/// In-process key provider for development and testing
pub struct MemoryKeyProvider {
    keys: Mutex<Vec<KeyMaterial>>,
}

impl MemoryKeyProvider {
    pub fn new(initial: KeyMaterial) -> Self {
        Self {
            keys: Mutex::new(vec![initial]),
        }
    }

    /// Start from a freshly generated key
    pub fn generate() -> Self {
        Self::new(random_key("key-1"))
    }
}

impl KeyProvider for MemoryKeyProvider {
    fn current_key(&self) -> Result<KeyMaterial> {
        let keys = self
            .keys
            .lock()
            .map_err(|e| AuditError::Encryption(format!("Failed to acquire key lock: {}", e)))?;
        keys.last()
            .cloned()
            .ok_or_else(|| AuditError::Encryption("Key provider holds no keys".to_string()))
    }

    fn next_key(&self) -> Result<KeyMaterial> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|e| AuditError::Encryption(format!("Failed to acquire key lock: {}", e)))?;
        let next = random_key(&format!("key-{}", keys.len() + 1));
        keys.push(next.clone());
        Ok(next)
    }
}

fn random_key(key_id: &str) -> KeyMaterial {
    let generated = Aes256Gcm::generate_key(&mut OsRng);
    let mut key = [0u8; 32];
    key.copy_from_slice(generated.as_slice());
    KeyMaterial {
        key_id: key_id.to_string(),
        key,
    }
}

struct KeyEntry {
    cipher: Aes256Gcm,
    retired_at: Option<DateTime<Utc>>,
}

struct KeyRing {
    active_key_id: String,
    keys: HashMap<String, KeyEntry>,
}

/// AES-256-GCM encryptor with key rotation support
///
/// Encrypts with the active key, decrypts with any registered key that has
/// not outlived its grace period. Rotation takes `&self`, so the encryptor can
/// be shared behind an `Arc` while calls are in flight.
pub struct Aes256GcmEncryptor {
    ring: RwLock<KeyRing>,
    grace_period: Duration,
    provider: Option<Arc<dyn KeyProvider>>,
}

impl Aes256GcmEncryptor {
    /// Create a new encryptor with a single key
    pub fn new(key_id: impl Into<String>, key: &[u8; 32], grace_period: Duration) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(
            key_id.clone(),
            KeyEntry {
                cipher: cipher_for(key),
                retired_at: None,
            },
        );

        Self {
            ring: RwLock::new(KeyRing {
                active_key_id: key_id,
                keys,
            }),
            grace_period,
            provider: None,
        }
    }

    /// Create an encryptor whose keys come from a secret provider
    pub fn from_provider(provider: Arc<dyn KeyProvider>, grace_period: Duration) -> Result<Self> {
        let current = provider.current_key()?;
        let mut encryptor = Self::new(current.key_id, &current.key, grace_period);
        encryptor.provider = Some(provider);
        Ok(encryptor)
    }

    /// Register a key for decryption only
    pub fn add_key(&self, key_id: impl Into<String>, key: &[u8; 32]) -> Result<()> {
        let mut ring = self.write_ring()?;
        ring.keys.insert(
            key_id.into(),
            KeyEntry {
                cipher: cipher_for(key),
                retired_at: None,
            },
        );
        Ok(())
    }

    /// Register a previously retired key, e.g. one restored from the secret provider
    pub fn add_retired_key(
        &self,
        key_id: impl Into<String>,
        key: &[u8; 32],
        retired_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut ring = self.write_ring()?;
        ring.keys.insert(
            key_id.into(),
            KeyEntry {
                cipher: cipher_for(key),
                retired_at: Some(retired_at),
            },
        );
        Ok(())
    }

    /// Make a registered key the active one, retiring the previous key
    pub fn rotate_to(&self, key_id: &str) -> Result<()> {
        let mut ring = self.write_ring()?;
        if !ring.keys.contains_key(key_id) {
            return Err(AuditError::KeyUnavailable {
                key_id: key_id.to_string(),
                reason: "not registered, add it first".to_string(),
            });
        }
        if ring.active_key_id == key_id {
            return Ok(());
        }

        let previous = std::mem::replace(&mut ring.active_key_id, key_id.to_string());
        let now = Utc::now();
        if let Some(entry) = ring.keys.get_mut(&previous) {
            entry.retired_at = Some(now);
        }
        if let Some(entry) = ring.keys.get_mut(key_id) {
            entry.retired_at = None;
        }

        tracing::info!(
            previous_key = %previous,
            active_key = %key_id,
            grace_days = self.grace_period.num_days(),
            "Audit encryption key rotated"
        );
        Ok(())
    }

    /// Introduce a new active key
    ///
    /// Pulls the next key from the secret provider when one is configured,
    /// otherwise generates one locally. Returns the new key ID.
    pub fn rotate_keys(&self) -> Result<String> {
        let next = match &self.provider {
            Some(provider) => provider.next_key()?,
            None => random_key(&format!("key-{}", uuid::Uuid::new_v4())),
        };
        self.add_key(next.key_id.clone(), &next.key)?;
        self.rotate_to(&next.key_id)?;
        Ok(next.key_id)
    }

    /// Drop retired keys whose grace period has ended, returning their IDs
    pub fn prune_expired_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut ring = self.write_ring()?;
        let grace = self.grace_period;
        let expired: Vec<String> = ring
            .keys
            .iter()
            .filter(|(_, entry)| matches!(entry.retired_at, Some(t) if t + grace <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            ring.keys.remove(id);
            tracing::info!(key_id = %id, "Expired audit encryption key pruned");
        }
        Ok(expired)
    }

    /// List all registered key IDs
    pub fn key_ids(&self) -> Vec<String> {
        self.ring
            .read()
            .map(|ring| ring.keys.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn write_ring(&self) -> Result<std::sync::RwLockWriteGuard<'_, KeyRing>> {
        self.ring
            .write()
            .map_err(|e| AuditError::Encryption(format!("Failed to acquire key lock: {}", e)))
    }

    fn read_ring(&self) -> Result<std::sync::RwLockReadGuard<'_, KeyRing>> {
        self.ring
            .read()
            .map_err(|e| AuditError::Encryption(format!("Failed to acquire key lock: {}", e)))
    }
}

fn cipher_for(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

impl AuditEncryptor for Aes256GcmEncryptor {
    fn encrypt(&self, event: &AuditEvent) -> Result<EncryptedAuditEvent> {
        let plaintext = serde_json::to_vec(event)?;

        let ring = self.read_ring()?;
        let entry = ring.keys.get(&ring.active_key_id).ok_or_else(|| {
            AuditError::KeyUnavailable {
                key_id: ring.active_key_id.clone(),
                reason: "active key not registered".to_string(),
            }
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = entry
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: event.audit_id.as_bytes(),
                },
            )
            .map_err(|e| AuditError::Encryption(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedAuditEvent {
            original_audit_id: event.audit_id.clone(),
            key_id: ring.active_key_id.clone(),
            nonce: BASE64.encode(nonce),
            encrypted_data: ciphertext,
            encrypted_at: Utc::now(),
        })
    }

    fn decrypt(&self, encrypted: &EncryptedAuditEvent) -> Result<AuditEvent> {
        let ring = self.read_ring()?;
        let entry = ring
            .keys
            .get(&encrypted.key_id)
            .ok_or_else(|| AuditError::KeyUnavailable {
                key_id: encrypted.key_id.clone(),
                reason: "not registered".to_string(),
            })?;

        if let Some(retired_at) = entry.retired_at {
            if retired_at + self.grace_period <= Utc::now() {
                return Err(AuditError::KeyUnavailable {
                    key_id: encrypted.key_id.clone(),
                    reason: format!("retired at {} and past its grace period", retired_at),
                });
            }
        }

        let nonce_bytes = BASE64
            .decode(&encrypted.nonce)
            .map_err(|e| AuditError::Encryption(format!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(AuditError::Encryption(format!(
                "Invalid nonce length: {}",
                nonce_bytes.len()
            )));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = entry
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &encrypted.encrypted_data,
                    aad: encrypted.original_audit_id.as_bytes(),
                },
            )
            .map_err(|e| AuditError::Encryption(format!("Decryption failed: {}", e)))?;

        let event: AuditEvent = serde_json::from_slice(&plaintext)?;
        if event.audit_id != encrypted.original_audit_id {
            return Err(AuditError::Encryption(format!(
                "Envelope ID '{}' does not match decrypted event '{}'",
                encrypted.original_audit_id, event.audit_id
            )));
        }
        Ok(event)
    }

    fn active_key_id(&self) -> String {
        self.ring
            .read()
            .map(|ring| ring.active_key_id.clone())
            .unwrap_or_default()
    }
}
