//! Provider registry: name resolution and health tracking.

use crate::config::{CairnConfig, RetryPolicy};
use crate::error::{CoreError, Result};
use crate::provider::{build_provider, Provider};
use crate::types::HealthStatus;
use crate::vault::CredentialVault;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

struct Entry {
    provider: Arc<dyn Provider>,
    health: HealthStatus,
    retry: RetryPolicy,
}

/// Configured provider units, resolved by name.
///
/// One coarse lock guards the table; it is never held across an await.
pub struct ProviderRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build every enabled provider in `config`.
    pub fn from_config(config: &CairnConfig) -> Result<Self> {
        let registry = Self::new();
        for (name, settings) in config.providers.iter().filter(|(_, s)| s.enabled) {
            let provider = build_provider(name, settings, config)?;
            registry.register(provider, config.retry_for(name));
        }
        tracing::info!(providers = ?registry.names(), "Provider registry ready");
        Ok(registry)
    }

    /// Register (or replace) a provider under its own name.
    pub fn register(&self, provider: Arc<dyn Provider>, retry: RetryPolicy) {
        let name = provider.name().to_string();
        let mut entries = self.write();
        if entries.contains_key(&name) {
            tracing::warn!(provider = %name, "Replacing registered provider");
        }
        entries.insert(
            name,
            Entry {
                provider,
                health: HealthStatus::Available,
                retry,
            },
        );
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Provider for new work. Fails if unknown or marked unavailable.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let entries = self.read();
        let entry = entries.get(name).ok_or_else(|| CoreError::ProviderUnavailable {
            provider: name.to_string(),
            reason: "not registered".into(),
        })?;
        match &entry.health {
            HealthStatus::Unavailable(reason) => Err(CoreError::ProviderUnavailable {
                provider: name.to_string(),
                reason: reason.clone(),
            }),
            _ => Ok(Arc::clone(&entry.provider)),
        }
    }

    /// Provider regardless of health, for releasing existing resources.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.read().get(name).map(|e| Arc::clone(&e.provider))
    }

    /// Retry policy for a provider (default policy if unknown).
    pub fn retry_policy(&self, name: &str) -> RetryPolicy {
        self.read()
            .get(name)
            .map(|e| e.retry)
            .unwrap_or_default()
    }

    /// Registered provider names.
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Cached health of one provider.
    pub fn health(&self, name: &str) -> Option<HealthStatus> {
        self.read().get(name).map(|e| e.health.clone())
    }

    /// Cached health of every provider.
    pub fn list_health(&self) -> BTreeMap<String, HealthStatus> {
        self.read()
            .iter()
            .map(|(name, e)| (name.clone(), e.health.clone()))
            .collect()
    }

    /// Record a new health status.
    pub fn set_health(&self, name: &str, status: HealthStatus) {
        if let Some(entry) = self.write().get_mut(name) {
            if entry.health != status {
                tracing::info!(provider = %name, health = %status, "Provider health changed");
            }
            entry.health = status;
        }
    }

    /// Mark a provider unavailable after a failed call.
    pub fn mark_unavailable(&self, name: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(provider = %name, reason = %reason, "Marking provider unavailable");
        self.set_health(name, HealthStatus::Unavailable(reason));
    }

    /// Probe every provider and cache the results.
    ///
    /// A provider whose credential is missing or cannot be decrypted is
    /// unavailable without contacting its backend. A panicking health check
    /// marks only that provider unavailable.
    pub async fn refresh_health(&self, vault: &CredentialVault) -> BTreeMap<String, HealthStatus> {
        let mut results = BTreeMap::new();
        for name in self.names() {
            if let Some(status) = self.refresh_provider(&name, vault).await {
                results.insert(name, status);
            }
        }
        results
    }

    /// Probe one provider and cache the result. `None` if it is not registered.
    pub async fn refresh_provider(&self, name: &str, vault: &CredentialVault) -> Option<HealthStatus> {
        let provider = self.get(name)?;
        let status = if provider.kind().requires_credential() {
            match vault.load(name) {
                Ok(secret) => probe(provider.as_ref(), Some(&secret)).await,
                Err(e) => HealthStatus::Unavailable(e.to_string()),
            }
        } else {
            probe(provider.as_ref(), None).await
        };
        self.set_health(name, status.clone());
        Some(status)
    }
}

async fn probe(provider: &dyn Provider, secret: Option<&crate::vault::Secret>) -> HealthStatus {
    match AssertUnwindSafe(provider.health_check(secret))
        .catch_unwind()
        .await
    {
        Ok(status) => status,
        Err(_) => {
            tracing::error!(provider = %provider.name(), "Health check panicked");
            HealthStatus::Unavailable("health check panicked".into())
        }
    }
}
