//! Credential vault — a passphrase-locked K/V holding provider API keys.
//!
//! The vault derives an AES-256-GCM key from `(passphrase, salt)` with
//! PBKDF2-HMAC-SHA256 and keeps the decrypted entries in memory only while
//! unlocked. Every mutation re-encrypts the full map and hands back a
//! `(salt, blob)` export for the caller to persist. Locking zeroizes the
//! in-memory entries and derived key but keeps the salt, so a later unlock
//! needs only the passphrase.

use std::collections::HashMap;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

pub const MIN_PASSPHRASE_LEN: usize = 8;

const PBKDF2_ITERATIONS: u32 = 150_000;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("vault is locked")]
    Locked,

    #[error("vault is not enabled: no salt has been provisioned")]
    NotEnabled,

    /// Wrong passphrase and corrupted blob are indistinguishable.
    #[error("vault authentication failed")]
    AuthFailed,

    #[error("new passphrase is below the minimum length of {min}")]
    NewPasswordTooShort { min: usize },

    #[error("vault crypto failure: {0}")]
    Crypto(String),
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;

/// The persistable state of the vault: a salt and the encrypted entry map,
/// both base64. The blob layout is `nonce || ciphertext`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultExport {
    pub salt: String,
    pub blob: String,
}

struct VaultInner {
    salt: Option<Vec<u8>>,
    /// Last encrypted export, kept even while locked.
    blob: Option<Vec<u8>>,
    /// Derived key, present only while unlocked.
    key: Option<[u8; KEY_LEN]>,
    /// Decrypted entries, present only while unlocked.
    entries: Option<HashMap<String, String>>,
}

impl VaultInner {
    fn zeroize_secrets(&mut self) {
        if let Some(mut key) = self.key.take() {
            key.zeroize();
        }
        if let Some(mut entries) = self.entries.take() {
            for (_, mut value) in entries.drain() {
                value.zeroize();
            }
        }
    }
}

impl Drop for VaultInner {
    fn drop(&mut self) {
        self.zeroize_secrets();
    }
}

/// Passphrase-locked credential store.
///
/// A single mutex guards all state; no operation holds it across an await.
pub struct Vault {
    inner: Mutex<VaultInner>,
}

impl Vault {
    /// An empty, not-yet-enabled vault.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VaultInner {
                salt: None,
                blob: None,
                key: None,
                entries: None,
            }),
        }
    }

    /// A locked vault seeded from a persisted `(salt, blob)` export.
    pub fn from_export(export: &VaultExport) -> VaultResult<Self> {
        let salt = BASE64
            .decode(&export.salt)
            .map_err(|e| VaultError::Crypto(format!("salt decode: {}", e)))?;
        let blob = BASE64
            .decode(&export.blob)
            .map_err(|e| VaultError::Crypto(format!("blob decode: {}", e)))?;
        Ok(Self {
            inner: Mutex::new(VaultInner {
                salt: Some(salt),
                blob: Some(blob),
                key: None,
                entries: None,
            }),
        })
    }

    /// First-time provisioning: generate a salt, derive a key under the
    /// passphrase, and export an empty entry map.
    pub fn initialize(&self, passphrase: &str) -> VaultResult<VaultExport> {
        if passphrase.len() < MIN_PASSPHRASE_LEN {
            return Err(VaultError::NewPasswordTooShort {
                min: MIN_PASSPHRASE_LEN,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = derive_key(passphrase, &salt);
        let entries = HashMap::new();
        let blob = encrypt_entries(&key, &entries)?;

        inner.zeroize_secrets();
        inner.salt = Some(salt);
        inner.blob = Some(blob);
        inner.key = Some(key);
        inner.entries = Some(entries);
        export_of(&inner)
    }

    /// Derive the key and decrypt the blob into memory. Any decrypt
    /// failure surfaces as [`VaultError::AuthFailed`].
    pub fn unlock(&self, passphrase: &str) -> VaultResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let salt = inner.salt.as_ref().ok_or(VaultError::NotEnabled)?;
        let blob = inner.blob.as_ref().ok_or(VaultError::NotEnabled)?;

        let key = derive_key(passphrase, salt);
        let entries = decrypt_entries(&key, blob)?;
        inner.zeroize_secrets();
        inner.key = Some(key);
        inner.entries = Some(entries);
        tracing::info!("vault unlocked");
        Ok(())
    }

    /// Zeroize the in-memory entries and derived key; the salt and the
    /// encrypted blob survive.
    pub fn lock(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.zeroize_secrets();
        tracing::info!("vault locked");
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().unwrap().entries.is_none()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().salt.is_some()
    }

    pub fn get(&self, key: &str) -> VaultResult<Option<String>> {
        let inner = self.inner.lock().unwrap();
        if inner.salt.is_none() {
            return Err(VaultError::NotEnabled);
        }
        let entries = inner.entries.as_ref().ok_or(VaultError::Locked)?;
        Ok(entries.get(key).cloned())
    }

    /// Set an entry, re-encrypt the full map, and return the new export
    /// for the caller to persist.
    pub fn set(&self, key: &str, value: &str) -> VaultResult<VaultExport> {
        let mut inner = self.inner.lock().unwrap();
        if inner.salt.is_none() {
            return Err(VaultError::NotEnabled);
        }
        let derived = inner.key.ok_or(VaultError::Locked)?;
        let entries = inner.entries.as_mut().ok_or(VaultError::Locked)?;
        entries.insert(key.to_string(), value.to_string());
        let blob = encrypt_entries(&derived, entries)?;
        inner.blob = Some(blob);
        export_of(&inner)
    }

    /// Remove an entry; a no-op export is still returned so callers can
    /// persist unconditionally.
    pub fn remove(&self, key: &str) -> VaultResult<VaultExport> {
        let mut inner = self.inner.lock().unwrap();
        if inner.salt.is_none() {
            return Err(VaultError::NotEnabled);
        }
        let derived = inner.key.ok_or(VaultError::Locked)?;
        let entries = inner.entries.as_mut().ok_or(VaultError::Locked)?;
        if let Some(mut removed) = entries.remove(key) {
            removed.zeroize();
        }
        let blob = encrypt_entries(&derived, entries)?;
        inner.blob = Some(blob);
        export_of(&inner)
    }

    /// Re-derive under a new passphrase (fresh salt) and re-encrypt.
    /// Requires the old passphrase to verify against the current blob.
    pub fn rotate_password(&self, old: &str, new: &str) -> VaultResult<VaultExport> {
        if new.len() < MIN_PASSPHRASE_LEN {
            return Err(VaultError::NewPasswordTooShort {
                min: MIN_PASSPHRASE_LEN,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        let salt = inner.salt.as_ref().ok_or(VaultError::NotEnabled)?;
        let blob = inner.blob.as_ref().ok_or(VaultError::NotEnabled)?;

        // Verify the old passphrase by decrypting the current blob.
        let old_key = derive_key(old, salt);
        let entries = decrypt_entries(&old_key, blob)?;

        let mut new_salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut new_salt);
        let new_key = derive_key(new, &new_salt);
        let new_blob = encrypt_entries(&new_key, &entries)?;

        inner.zeroize_secrets();
        inner.salt = Some(new_salt);
        inner.blob = Some(new_blob);
        inner.key = Some(new_key);
        inner.entries = Some(entries);
        tracing::info!("vault passphrase rotated");
        export_of(&inner)
    }

    /// Current salt, base64. `None` until the vault is provisioned.
    pub fn salt(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.salt.as_ref().map(|s| BASE64.encode(s))
    }

    /// Current `(salt, blob)` export.
    pub fn export(&self) -> VaultResult<VaultExport> {
        let inner = self.inner.lock().unwrap();
        if inner.salt.is_none() {
            return Err(VaultError::NotEnabled);
        }
        export_of(&inner)
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

fn export_of(inner: &VaultInner) -> VaultResult<VaultExport> {
    let salt = inner.salt.as_ref().ok_or(VaultError::NotEnabled)?;
    let blob = inner.blob.as_ref().ok_or(VaultError::NotEnabled)?;
    Ok(VaultExport {
        salt: BASE64.encode(salt),
        blob: BASE64.encode(blob),
    })
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn encrypt_entries(
    key: &[u8; KEY_LEN],
    entries: &HashMap<String, String>,
) -> VaultResult<Vec<u8>> {
    let mut plaintext = serde_json::to_vec(entries)
        .map_err(|e| VaultError::Crypto(format!("serialize: {}", e)))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| VaultError::Crypto("encryption failed".to_string()))?;
    plaintext.zeroize();

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn decrypt_entries(key: &[u8; KEY_LEN], blob: &[u8]) -> VaultResult<HashMap<String, String>> {
    if blob.len() < NONCE_LEN {
        return Err(VaultError::AuthFailed);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);

    // GCM authenticates; a wrong key and a tampered blob both fail here.
    let mut plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| VaultError::AuthFailed)?;
    let entries: HashMap<String, String> =
        serde_json::from_slice(&plaintext).map_err(|_| VaultError::AuthFailed)?;
    plaintext.zeroize();
    Ok(entries)
}
