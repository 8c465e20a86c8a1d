//! Blocking entry point for callers outside any async runtime.
//!
//! [`SandboxService`] wires the store, vault, provider registry, bridge,
//! lifecycle manager and reaper together and exposes every operation as a
//! plain blocking call. Calls are safe from any number of threads.
//!
//! # Example
//!
//! ```ignore
//! use cairn_core::{CairnConfig, SandboxConfig, SandboxService};
//!
//! let service = SandboxService::new(CairnConfig::from_env())?;
//! let sandbox = service.create(SandboxConfig::default())?;
//! let out = service.execute(sandbox.id, "echo hi", None)?;
//! assert_eq!(out.stdout, "hi\n");
//! service.destroy(sandbox.id)?;
//! service.shutdown();
//! ```

use crate::bridge::{Bridge, BridgeConfig, BridgeStats, Pending};
use crate::config::{CairnConfig, SandboxConfig};
use crate::error::{CoreError, Result};
use crate::lifecycle::{HistoryRecord, LifecycleManager, ManagerSettings};
use crate::reaper::Reaper;
use crate::registry::ProviderRegistry;
use crate::sandbox::{Operation, SandboxId, SandboxInstance, SandboxState};
use crate::store::{FileStore, MemoryStore, Store};
use crate::types::{CommandSpec, ExecutionResult, FileInfo, HealthStatus, SnapshotRecord};
use crate::vault::CredentialVault;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long shutdown waits for in-flight work after destroying sandboxes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The sandbox service.
pub struct SandboxService {
    config: CairnConfig,
    registry: Arc<ProviderRegistry>,
    vault: Arc<CredentialVault>,
    bridge: Arc<Bridge>,
    manager: Arc<LifecycleManager>,
    reaper: Mutex<Option<Reaper>>,
    closed: AtomicBool,
}

impl SandboxService {
    /// Build the service from configuration.
    ///
    /// Uses a [`FileStore`] when `state_dir` is set and an in-memory store
    /// otherwise. Provider health is probed once before returning.
    pub fn new(config: CairnConfig) -> Result<Self> {
        config.validate()?;
        let registry = ProviderRegistry::from_config(&config)?;
        let store: Arc<dyn Store> = match &config.state_dir {
            Some(dir) => Arc::new(FileStore::open(dir)?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_parts(config, registry, store)
    }

    /// Build the service around an existing registry and store.
    pub fn with_parts(
        config: CairnConfig,
        registry: ProviderRegistry,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        let master = config.master_secret.resolve()?;
        let vault = Arc::new(CredentialVault::new(
            Arc::clone(&store),
            &config.profile,
            master,
            config.kdf_iterations,
        )?);
        let registry = Arc::new(registry);
        let bridge = Arc::new(Bridge::new(BridgeConfig {
            workers: config.workers,
            queue_depth: config.queue_depth,
        })?);
        let manager = LifecycleManager::new(
            Arc::clone(&registry),
            Arc::clone(&vault),
            store,
            Arc::clone(&bridge),
            ManagerSettings::from_config(&config),
        );
        let reaper = Reaper::start(&manager, bridge.handle(), config.sweep_interval);

        let service = Self {
            config,
            registry,
            vault,
            bridge,
            manager,
            reaper: Mutex::new(Some(reaper)),
            closed: AtomicBool::new(false),
        };

        match service.refresh_health() {
            Ok(health) => tracing::info!(health = ?health, "Sandbox service ready"),
            Err(e) => tracing::warn!(error = %e, "Initial health check failed"),
        }
        Ok(service)
    }

    /// Get the service configuration.
    pub fn config(&self) -> &CairnConfig {
        &self.config
    }

    fn ensure_open(&self, target: &str, operation: Operation) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Overloaded {
                target: target.to_string(),
                operation,
                queued: self.bridge.queued(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Sandbox operations
    // ========================================================================

    /// Create a sandbox and wait until it is Ready.
    pub fn create(&self, config: SandboxConfig) -> Result<SandboxInstance> {
        self.ensure_open("service", Operation::Create)?;
        self.manager.create(config)
    }

    /// Run a command. `timeout` defaults to the sandbox's limit.
    ///
    /// Pass a [`CommandSpec`] to run in a subdirectory or with extra
    /// environment variables for this call only.
    pub fn execute(
        &self,
        id: SandboxId,
        command: impl Into<CommandSpec>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        self.ensure_open(&id.to_string(), Operation::Execute)?;
        self.manager.execute(id, command, timeout)
    }

    /// Queue a command without waiting. Use the returned handle to wait or
    /// to cancel it.
    pub fn submit_execute(
        &self,
        id: SandboxId,
        command: impl Into<CommandSpec>,
        timeout: Option<Duration>,
    ) -> Result<Pending<ExecutionResult>> {
        self.ensure_open(&id.to_string(), Operation::Execute)?;
        self.manager.submit_execute(id, command, timeout)
    }

    /// List a directory. `/` is the sandbox working directory.
    pub fn list_files(&self, id: SandboxId, path: &str) -> Result<Vec<FileInfo>> {
        self.ensure_open(&id.to_string(), Operation::ListFiles)?;
        self.manager.list_files(id, path)
    }

    /// Write a file.
    pub fn upload_file(&self, id: SandboxId, path: &str, content: impl Into<Vec<u8>>) -> Result<()> {
        self.ensure_open(&id.to_string(), Operation::UploadFile)?;
        self.manager.upload_file(id, path, content.into())
    }

    /// Read a file.
    pub fn download_file(&self, id: SandboxId, path: &str) -> Result<Vec<u8>> {
        self.ensure_open(&id.to_string(), Operation::DownloadFile)?;
        self.manager.download_file(id, path)
    }

    /// Capture a sandbox.
    pub fn snapshot(&self, id: SandboxId, label: &str) -> Result<SnapshotRecord> {
        self.ensure_open(&id.to_string(), Operation::Snapshot)?;
        self.manager.snapshot(id, label)
    }

    /// Restore a snapshot into a sandbox of the same provider.
    pub fn restore(&self, id: SandboxId, snapshot: &SnapshotRecord) -> Result<()> {
        self.ensure_open(&id.to_string(), Operation::Restore)?;
        self.manager.restore(id, snapshot)
    }

    /// Destroy a sandbox. Destroying twice succeeds.
    pub fn destroy(&self, id: SandboxId) -> Result<()> {
        self.ensure_open(&id.to_string(), Operation::Destroy)?;
        self.manager.destroy(id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current lifecycle state of a sandbox.
    pub fn get_instance_state(&self, id: SandboxId) -> Result<SandboxState> {
        self.manager.state(id)
    }

    /// Full instance record.
    pub fn get_instance(&self, id: SandboxId) -> Result<SandboxInstance> {
        self.manager.instance(id)
    }

    /// Every tracked sandbox, oldest first.
    pub fn list_instances(&self) -> Vec<SandboxInstance> {
        self.manager.list_instances()
    }

    /// Snapshots taken from a sandbox.
    pub fn list_snapshots(&self, id: SandboxId) -> Result<Vec<SnapshotRecord>> {
        self.manager.list_snapshots(id)
    }

    /// History of a sandbox, in order. Kept after the sandbox is destroyed.
    pub fn history(&self, id: SandboxId) -> Result<Vec<HistoryRecord>> {
        self.manager.history(id)
    }

    /// Delete the history of a sandbox and the data of its snapshots.
    pub fn purge_history(&self, id: SandboxId) -> Result<usize> {
        self.manager.purge_history(id)
    }

    /// Cached provider health.
    pub fn list_provider_health(&self) -> BTreeMap<String, HealthStatus> {
        self.registry.list_health()
    }

    /// Probe every provider now.
    pub fn refresh_health(&self) -> Result<BTreeMap<String, HealthStatus>> {
        let registry = Arc::clone(&self.registry);
        let vault = Arc::clone(&self.vault);
        self.bridge.run(
            None,
            "providers",
            Operation::HealthCheck,
            self.config.op_timeout,
            async move { Ok(registry.refresh_health(&vault).await) },
        )
    }

    /// Bridge counters.
    pub fn bridge_stats(&self) -> &BridgeStats {
        self.bridge.stats()
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    /// Store a provider credential and re-probe that provider.
    pub fn save_credential(&self, provider: &str, secret: &str) -> Result<HealthStatus> {
        self.vault.save(provider, secret)?;
        let registry = Arc::clone(&self.registry);
        let vault = Arc::clone(&self.vault);
        let name = provider.to_string();
        let status = self.bridge.run(
            None,
            provider,
            Operation::HealthCheck,
            self.config.op_timeout,
            async move { Ok(registry.refresh_provider(&name, &vault).await) },
        )?;
        Ok(status.unwrap_or_else(|| HealthStatus::Unavailable("provider not configured".into())))
    }

    /// Remove a provider credential. Returns whether one existed.
    pub fn remove_credential(&self, provider: &str) -> Result<bool> {
        let removed = self.vault.remove(provider)?;
        if removed && self.registry.get(provider).is_some_and(|p| p.kind().requires_credential()) {
            self.registry.mark_unavailable(provider, "credential removed");
        }
        Ok(removed)
    }

    /// Whether a credential is stored for a provider.
    pub fn has_credential(&self, provider: &str) -> bool {
        self.vault.has(provider)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop accepting work, destroy every sandbox and drain the bridge.
    ///
    /// Returns `true` if all work drained within the grace period. Safe to
    /// call more than once.
    pub fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return self.bridge.in_flight() == 0;
        }
        tracing::info!(sandboxes = self.manager.count(), "Shutting down sandbox service");

        if let Some(mut reaper) = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            reaper.stop();
        }
        let destroyed = self.manager.destroy_all();
        let drained = self.bridge.shutdown(SHUTDOWN_GRACE);
        tracing::info!(destroyed, drained, "Sandbox service stopped");
        drained
    }
}

impl Drop for SandboxService {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) && self.manager.count() > 0 {
            tracing::warn!(
                sandboxes = self.manager.count(),
                "Sandbox service dropped without shutdown, sandboxes leak"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterSecretSource;

    fn service(dir: &std::path::Path) -> SandboxService {
        let mut config = CairnConfig::default();
        config.local_root = dir.join("sandboxes");
        config.master_secret = MasterSecretSource::Inline("test-master".into());
        config.kdf_iterations = 1_000;
        SandboxService::new(config).unwrap()
    }

    #[test]
    fn test_service_starts_with_local_provider() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(dir.path());
        let health = s.list_provider_health();
        assert_eq!(health.get("local"), Some(&HealthStatus::Available));
        assert!(s.list_instances().is_empty());
        assert!(s.shutdown());
    }

    #[test]
    fn test_shutdown_destroys_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(dir.path());
        let id = s.create(SandboxConfig::default()).unwrap().id;
        assert!(s.shutdown());
        assert!(matches!(
            s.get_instance_state(id),
            Err(CoreError::InstanceNotFound(_))
        ));
        assert!(matches!(
            s.create(SandboxConfig::default()),
            Err(CoreError::Overloaded { .. })
        ));
        // Second call is a no-op.
        assert!(s.shutdown());
    }

    #[test]
    fn test_credentials_through_service() {
        let dir = tempfile::tempdir().unwrap();
        let s = service(dir.path());
        assert!(!s.has_credential("e2b"));
        let status = s.save_credential("e2b", "e2b_live_key_123").unwrap();
        // Not configured in this service.
        assert!(matches!(status, HealthStatus::Unavailable(_)));
        assert!(s.has_credential("e2b"));
        assert!(s.remove_credential("e2b").unwrap());
        assert!(!s.remove_credential("e2b").unwrap());
        s.shutdown();
    }
}
