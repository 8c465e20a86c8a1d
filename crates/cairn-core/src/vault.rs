//! Credential vault.
//!
//! Secrets are sealed with AES-256-GCM under a key derived from the master
//! secret with PBKDF2-HMAC-SHA256 and a per-entry random salt. The provider
//! name is bound as associated data, so a blob copied to another provider's
//! entry fails to open.

use crate::error::{CoreError, Result};
use crate::store::Store;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Default PBKDF2 iteration count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Encrypted credential as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    /// Provider the secret belongs to.
    pub provider: String,
    /// Configuration profile.
    pub profile: String,
    /// base64(nonce || ciphertext || tag).
    pub blob: String,
    /// base64 key-derivation salt.
    pub salt: String,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// Plaintext secret handed to providers for the duration of one call.
///
/// `Debug` and `Display` never print the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a plaintext value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mask(&self.0))
    }
}

/// Masked rendering for display: first four characters then asterisks.
///
/// Short values are masked entirely.
pub fn mask(secret: &str) -> String {
    if secret.chars().count() <= 8 {
        return "********".into();
    }
    let head: String = secret.chars().take(4).collect();
    format!("{head}********")
}

/// Encrypts, stores and decrypts per-provider secrets.
pub struct CredentialVault {
    store: Arc<dyn Store>,
    profile: String,
    master: Option<Vec<u8>>,
    iterations: NonZeroU32,
    rng: SystemRandom,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("profile", &self.profile)
            .field("enabled", &self.master.is_some())
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl CredentialVault {
    /// Create a vault over `store`.
    ///
    /// With `master == None` the vault is disabled: saves are rejected and
    /// every load reports `CredentialUnavailable`.
    pub fn new(
        store: Arc<dyn Store>,
        profile: impl Into<String>,
        master: Option<Vec<u8>>,
        iterations: u32,
    ) -> Result<Self> {
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| CoreError::InvalidConfig("kdf iterations must be > 0".into()))?;
        if matches!(&master, Some(m) if m.is_empty()) {
            return Err(CoreError::InvalidConfig("master secret must not be empty".into()));
        }
        let profile = profile.into();
        tracing::info!(profile = %profile, enabled = master.is_some(), "Credential vault ready");
        Ok(Self {
            store,
            profile,
            master,
            iterations,
            rng: SystemRandom::new(),
        })
    }

    /// Whether a master secret is configured.
    pub fn is_enabled(&self) -> bool {
        self.master.is_some()
    }

    /// Active profile name.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Encrypt and store `secret` for `provider`, replacing any prior entry.
    pub fn save(&self, provider: &str, secret: &str) -> Result<()> {
        let master = self.master.as_deref().ok_or_else(|| {
            CoreError::InvalidConfig("credential vault has no master secret".into())
        })?;

        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        self.fill(&mut salt)?;
        self.fill(&mut nonce)?;

        let key = self.derive_key(master, &salt, provider)?;
        let mut in_out = secret.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(provider.as_bytes()),
            &mut in_out,
        )
        .map_err(|_| CoreError::CredentialUnavailable {
            provider: provider.to_string(),
        })?;

        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&in_out);

        let entry = CredentialEntry {
            provider: provider.to_string(),
            profile: self.profile.clone(),
            blob: BASE64.encode(&blob),
            salt: BASE64.encode(salt),
            updated_at: Utc::now(),
        };
        self.store.save_credential(&entry)?;
        tracing::info!(provider = %provider, profile = %self.profile, "Credential saved");
        Ok(())
    }

    /// Decrypt the secret for `provider`.
    ///
    /// Missing entries, a disabled vault, a wrong key or a corrupted blob all
    /// surface as `CredentialUnavailable`.
    pub fn load(&self, provider: &str) -> Result<Secret> {
        let unavailable = || CoreError::CredentialUnavailable {
            provider: provider.to_string(),
        };

        let Some(master) = self.master.as_deref() else {
            return Err(unavailable());
        };
        let entry = match self.store.load_credential(&self.profile, provider) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Err(unavailable()),
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "Credential entry unreadable");
                return Err(unavailable());
            }
        };

        match self.open(master, provider, &entry) {
            Some(secret) => Ok(secret),
            None => {
                tracing::warn!(provider = %provider, profile = %self.profile, "Credential failed to decrypt");
                Err(unavailable())
            }
        }
    }

    /// Whether an entry exists for `provider` (it may still fail to decrypt).
    pub fn has(&self, provider: &str) -> bool {
        matches!(
            self.store.load_credential(&self.profile, provider),
            Ok(Some(_))
        )
    }

    /// Delete the entry for `provider`. Returns whether one existed.
    pub fn remove(&self, provider: &str) -> Result<bool> {
        let removed = self.store.delete_credential(&self.profile, provider)?;
        if removed {
            tracing::info!(provider = %provider, profile = %self.profile, "Credential removed");
        }
        Ok(removed)
    }

    fn open(&self, master: &[u8], provider: &str, entry: &CredentialEntry) -> Option<Secret> {
        let salt = BASE64.decode(&entry.salt).ok()?;
        let blob = BASE64.decode(&entry.blob).ok()?;
        if blob.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return None;
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).ok()?;
        let key = self.derive_key(master, &salt, provider).ok()?;

        let mut in_out = sealed.to_vec();
        let plain = key
            .open_in_place(nonce, Aad::from(provider.as_bytes()), &mut in_out)
            .ok()?;
        String::from_utf8(plain.to_vec()).ok().map(Secret)
    }

    fn derive_key(&self, master: &[u8], salt: &[u8], provider: &str) -> Result<LessSafeKey> {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            self.iterations,
            salt,
            master,
            &mut key,
        );
        let unbound =
            UnboundKey::new(&AES_256_GCM, &key).map_err(|_| CoreError::CredentialUnavailable {
                provider: provider.to_string(),
            })?;
        Ok(LessSafeKey::new(unbound))
    }

    fn fill(&self, buf: &mut [u8]) -> Result<()> {
        self.rng
            .fill(buf)
            .map_err(|_| CoreError::Store("system random source failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn vault(store: Arc<dyn Store>, master: &str) -> CredentialVault {
        CredentialVault::new(store, "default", Some(master.as_bytes().to_vec()), 1_000).unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let vault = vault(store, "master");
        vault.save("e2b", "secret123").unwrap();
        assert_eq!(vault.load("e2b").unwrap().expose(), "secret123");
        assert!(vault.has("e2b"));
    }

    #[test]
    fn test_blob_does_not_contain_plaintext() {
        let store = Arc::new(MemoryStore::new());
        let vault = vault(store.clone(), "master");
        vault.save("e2b", "secret123").unwrap();
        let entry = store.load_credential("default", "e2b").unwrap().unwrap();
        assert!(!entry.blob.contains("secret123"));
        let raw = BASE64.decode(&entry.blob).unwrap();
        assert!(!raw.windows(9).any(|w| w == b"secret123"));
    }

    #[test]
    fn test_overwrite_replaces_entry() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let vault = vault(store, "master");
        vault.save("morph", "old").unwrap();
        vault.save("morph", "new").unwrap();
        assert_eq!(vault.load("morph").unwrap().expose(), "new");
    }

    #[test]
    fn test_wrong_master_is_unavailable() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        vault(store.clone(), "right").save("e2b", "secret123").unwrap();
        let err = vault(store, "wrong").load("e2b").unwrap_err();
        assert!(matches!(err, CoreError::CredentialUnavailable { .. }));
        assert!(!err.to_string().contains("secret123"));
    }

    #[test]
    fn test_blob_moved_to_other_provider_fails() {
        let store = Arc::new(MemoryStore::new());
        let vault = vault(store.clone(), "master");
        vault.save("e2b", "secret123").unwrap();
        let mut entry = store.load_credential("default", "e2b").unwrap().unwrap();
        entry.provider = "modal".into();
        store.save_credential(&entry).unwrap();
        assert!(matches!(
            vault.load("modal"),
            Err(CoreError::CredentialUnavailable { .. })
        ));
    }

    #[test]
    fn test_disabled_vault() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let vault = CredentialVault::new(store, "default", None, 1_000).unwrap();
        assert!(!vault.is_enabled());
        assert!(vault.save("e2b", "x").is_err());
        assert!(matches!(
            vault.load("e2b"),
            Err(CoreError::CredentialUnavailable { .. })
        ));
    }

    #[test]
    fn test_secret_redaction() {
        let secret = Secret::new("sk-live-abcdefghijkl");
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");
        assert_eq!(secret.to_string(), "sk-l********");
        assert_eq!(mask("short"), "********");
    }
}
