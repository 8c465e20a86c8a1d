//! Lifecycle manager for every sandbox instance.
//!
//! The manager owns the instance records and is the only place lifecycle
//! state changes. Provider calls run on the bridge; all work for one sandbox
//! goes through that sandbox's lane, so at most one provider call per
//! sandbox is in flight. State checks take a short per-instance lock and
//! never wait on a backend.
//!
//! # Failure handling
//!
//! - Retryable backend failures are retried with the provider's backoff.
//! - A backend that lost the instance moves the sandbox to `Failed`.
//! - Credential and provider-level failures, and panics inside a provider,
//!   mark the provider unavailable in the registry.

use super::history::{CommandOutcome, CommandRecord, HistoryEvent, HistoryRecord};
use crate::bridge::{Bridge, Pending};
use crate::config::{CairnConfig, SandboxConfig};
use crate::error::{CoreError, Result};
use crate::provider::Provider;
use crate::registry::ProviderRegistry;
use crate::sandbox::{Operation, RetiredIds, SandboxId, SandboxInstance, SandboxState};
use crate::store::Store;
use crate::types::{CommandSpec, ExecutionResult, FileInfo, SnapshotRecord};
use crate::vault::{CredentialVault, Secret};
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Settings
// ============================================================================

/// Timing and routing settings for the manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Provider used when a config names none.
    pub default_provider: String,
    /// Deadline for everything except Execute.
    pub op_timeout: Duration,
    /// Added to a command's own timeout to form the Execute deadline.
    pub deadline_slack: Duration,
    /// Running sandboxes with no activity for this long become Idle.
    pub idle_after: Duration,
    /// Sandboxes with no activity for this long are destroyed.
    pub idle_timeout: Duration,
}

impl ManagerSettings {
    /// Take the manager's settings from the service configuration.
    pub fn from_config(config: &CairnConfig) -> Self {
        Self {
            default_provider: config.default_provider.clone(),
            op_timeout: config.op_timeout,
            deadline_slack: config.deadline_slack,
            idle_after: config.idle_after,
            idle_timeout: config.idle_timeout,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&CairnConfig::default())
    }
}

/// What one reaper sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Running sandboxes moved to Idle.
    pub idled: usize,
    /// Sandboxes queued for destruction.
    pub evicted: usize,
}

// ============================================================================
// Instance slots
// ============================================================================

struct Slot {
    id: SandboxId,
    provider: String,
    config: SandboxConfig,
    instance: Mutex<SandboxInstance>,
    snapshots: Mutex<Vec<SnapshotRecord>>,
    seq: AtomicU64,
}

impl Slot {
    fn new(id: SandboxId, provider: &str, config: SandboxConfig) -> Self {
        Self {
            id,
            provider: provider.to_string(),
            config,
            instance: Mutex::new(SandboxInstance::requested(id, provider)),
            snapshots: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn instance(&self) -> MutexGuard<'_, SandboxInstance> {
        lock(&self.instance)
    }

    fn state(&self) -> SandboxState {
        self.instance().state
    }

    fn check(&self, operation: Operation) -> Result<()> {
        let state = self.state();
        if state.permits(operation) {
            Ok(())
        } else {
            Err(CoreError::InvalidStateTransition {
                id: self.id,
                state,
                operation,
            })
        }
    }

    fn touch(&self) {
        self.instance().last_activity = Utc::now();
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Operations after which the sandbox footprint may have changed.
fn may_change_usage(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::Execute | Operation::UploadFile | Operation::Restore
    )
}

// ============================================================================
// Manager
// ============================================================================

/// Tracks sandbox instances and drives them through their lifecycle.
///
/// Always used behind an `Arc`: work submitted to the bridge keeps the
/// manager alive until it finishes.
pub struct LifecycleManager {
    registry: Arc<ProviderRegistry>,
    vault: Arc<CredentialVault>,
    store: Arc<dyn Store>,
    bridge: Arc<Bridge>,
    settings: ManagerSettings,
    instances: RwLock<HashMap<SandboxId, Arc<Slot>>>,
    retired: Mutex<RetiredIds>,
}

impl LifecycleManager {
    /// Create a manager over the given collaborators.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        vault: Arc<CredentialVault>,
        store: Arc<dyn Store>,
        bridge: Arc<Bridge>,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        tracing::info!(
            default_provider = %settings.default_provider,
            op_timeout_ms = settings.op_timeout.as_millis() as u64,
            "Creating lifecycle manager"
        );
        Arc::new(Self {
            registry,
            vault,
            store,
            bridge,
            settings,
            instances: RwLock::new(HashMap::new()),
            retired: Mutex::new(RetiredIds::default()),
        })
    }

    /// Get the manager settings.
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Get the bridge the manager submits work to.
    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    fn read_instances(&self) -> RwLockReadGuard<'_, HashMap<SandboxId, Arc<Slot>>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_instances(&self) -> RwLockWriteGuard<'_, HashMap<SandboxId, Arc<Slot>>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, id: SandboxId) -> Result<Arc<Slot>> {
        self.read_instances()
            .get(&id)
            .cloned()
            .ok_or(CoreError::InstanceNotFound(id))
    }

    fn is_retired(&self, id: SandboxId) -> bool {
        lock(&self.retired).contains(&id)
    }

    fn retire(&self, id: SandboxId) {
        self.write_instances().remove(&id);
        lock(&self.retired).insert(id);
    }

    /// State check plus provider lookup, done before anything is queued.
    fn admit(&self, slot: &Slot, operation: Operation) -> Result<Arc<dyn Provider>> {
        slot.check(operation)?;
        self.registry.resolve(&slot.provider)
    }

    // ------------------------------------------------------------------------
    // State and history
    // ------------------------------------------------------------------------

    /// Move `slot` to `to` if the state machine allows it.
    fn advance(&self, slot: &Slot, to: SandboxState, operation: Option<Operation>) -> bool {
        let from = {
            let mut instance = slot.instance();
            let from = instance.state;
            if from == to {
                return true;
            }
            if !from.can_transition_to(to) {
                tracing::debug!(sandbox_id = %slot.id, from = %from, to = %to, "Transition not allowed");
                return false;
            }
            instance.state = to;
            from
        };
        tracing::info!(sandbox_id = %slot.id, from = %from, to = %to, "Sandbox state changed");
        self.record(slot, HistoryEvent::Lifecycle { from, to, operation });
        true
    }

    fn record(&self, slot: &Slot, event: HistoryEvent) {
        let record = HistoryRecord {
            sandbox_id: slot.id,
            seq: slot.next_seq(),
            recorded_at: Utc::now(),
            event,
        };
        if let Err(e) = self.store.save_history_record(&record) {
            tracing::error!(sandbox_id = %slot.id, seq = record.seq, error = %e, "Failed to persist history record");
        }
    }

    fn record_rejected(&self, slot: &Slot, command: &str, error: &CoreError) {
        let now = Utc::now();
        self.record(
            slot,
            HistoryEvent::Command(CommandRecord {
                command: command.to_string(),
                started_at: now,
                finished_at: now,
                outcome: CommandOutcome::from_result(&Err(error.clone())),
            }),
        );
    }

    /// Post-call bookkeeping shared by every work operation.
    fn settle<T>(&self, slot: &Slot, operation: Operation, result: &Result<T>) {
        match result {
            Ok(_) => {
                slot.touch();
                let state = slot.state();
                if state == SandboxState::Idle
                    || (state == SandboxState::Ready && operation == Operation::Execute)
                {
                    self.advance(slot, SandboxState::Running, Some(operation));
                }
            }
            Err(e) if e.is_unrecoverable() => {
                tracing::error!(sandbox_id = %slot.id, operation = %operation, error = %e, "Backend lost sandbox");
                self.advance(slot, SandboxState::Failed, Some(operation));
            }
            Err(_) => {}
        }
    }

    // ------------------------------------------------------------------------
    // Provider calls
    // ------------------------------------------------------------------------

    async fn credential(&self, provider: &Arc<dyn Provider>) -> Result<Option<Secret>> {
        if !provider.kind().requires_credential() {
            return Ok(None);
        }
        let name = provider.name().to_string();
        let vault = Arc::clone(&self.vault);
        let lookup = name.clone();
        let loaded = tokio::task::spawn_blocking(move || vault.load(&lookup))
            .await
            .map_err(|e| CoreError::backend(&name, format!("credential lookup failed: {e}")))?;
        loaded.map(Some).map_err(|e| {
            self.registry.mark_unavailable(&name, e.to_string());
            e
        })
    }

    /// One provider call with credential injection, retries and panic
    /// containment.
    async fn call<T, F, Fut>(
        &self,
        provider: &Arc<dyn Provider>,
        id: SandboxId,
        operation: Operation,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<dyn Provider>, Option<Secret>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = provider.name().to_string();
        let credential = self.credential(provider).await?;
        let policy = self.registry.retry_policy(&name);

        let mut attempt = 0;
        loop {
            let outcome = AssertUnwindSafe(f(Arc::clone(provider), credential.clone()))
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    let reason = format!("{operation} panicked");
                    tracing::error!(provider = %name, sandbox_id = %id, operation = %operation, "Provider panicked");
                    self.registry.mark_unavailable(&name, reason.clone());
                    return Err(CoreError::ProviderUnavailable {
                        provider: name,
                        reason,
                    });
                }
            };

            match result {
                Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        provider = %name,
                        sandbox_id = %id,
                        operation = %operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient backend failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.degrades_provider() {
                        self.registry.mark_unavailable(&name, e.to_string());
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    async fn refresh_usage(&self, slot: &Slot, provider: &Arc<dyn Provider>) {
        match provider.usage(slot.id).await {
            Ok(usage) => slot.instance().usage = usage,
            Err(e) => tracing::debug!(sandbox_id = %slot.id, error = %e, "Usage not available"),
        }
    }

    /// Queue `body` on the sandbox's lane with the shared checks around it.
    fn submit_work<T, F, Fut>(
        self: &Arc<Self>,
        id: SandboxId,
        operation: Operation,
        body: F,
    ) -> Result<Pending<T>>
    where
        F: FnOnce(Arc<Self>, Arc<Slot>, Arc<dyn Provider>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self.slot(id)?;
        let provider = self.admit(&slot, operation)?;
        let this = Arc::clone(self);
        let work = async move {
            // Whatever ran ahead of us on the lane may have changed the state.
            slot.check(operation)?;
            slot.touch();
            let result = body(Arc::clone(&this), Arc::clone(&slot), Arc::clone(&provider)).await;
            if result.is_ok() && may_change_usage(operation) {
                this.refresh_usage(&slot, &provider).await;
            }
            this.settle(&slot, operation, &result);
            result
        };
        self.bridge
            .submit(Some(id), id.to_string(), operation, self.settings.op_timeout, work)
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Provision a sandbox and wait until it is Ready.
    ///
    /// If the caller's deadline passes first, the instance is marked Failed
    /// and whatever the backend ends up creating is destroyed.
    pub fn create(self: &Arc<Self>, config: SandboxConfig) -> Result<SandboxInstance> {
        config.validate()?;
        let provider_name = config
            .provider
            .clone()
            .unwrap_or_else(|| self.settings.default_provider.clone());
        let provider = self.registry.resolve(&provider_name)?;
        let mut config = config;
        config.provider = Some(provider_name.clone());

        let id = SandboxId::new();
        let slot = Arc::new(Slot::new(id, &provider_name, config));
        self.write_instances().insert(id, Arc::clone(&slot));
        tracing::info!(sandbox_id = %id, provider = %provider_name, "Sandbox requested");

        let this = Arc::clone(self);
        let work = async move {
            let start = Instant::now();
            let config = &slot.config;
            let result = this
                .call(&provider, id, Operation::Create, move |p, cred| async move {
                    p.create(id, config, cred.as_ref()).await
                })
                .await;

            match result {
                Ok(created) => {
                    if !this.advance(&slot, SandboxState::Ready, Some(Operation::Create)) {
                        // Abandoned by a caller that timed out; a destroy
                        // is queued behind us.
                        return Err(CoreError::Cancelled {
                            target: id.to_string(),
                            operation: Operation::Create,
                        });
                    }
                    let instance = {
                        let mut instance = slot.instance();
                        instance.usage = created.usage;
                        instance.last_activity = Utc::now();
                        instance.clone()
                    };
                    tracing::info!(
                        sandbox_id = %id,
                        provider = %slot.provider,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Sandbox ready"
                    );
                    Ok(instance)
                }
                Err(e) => {
                    tracing::error!(sandbox_id = %id, provider = %slot.provider, error = %e, "Sandbox creation failed");
                    this.advance(&slot, SandboxState::Failed, Some(Operation::Create));
                    Err(e)
                }
            }
        };

        let abort_this = Arc::clone(self);
        let on_abort = move |_started: bool| async move {
            abort_this.abandon_create(id);
        };

        match self.bridge.submit_with_abort(
            Some(id),
            id.to_string(),
            Operation::Create,
            self.settings.op_timeout,
            work,
            on_abort,
        ) {
            Ok(pending) => pending.wait(),
            Err(e) => {
                self.write_instances().remove(&id);
                Err(e)
            }
        }
    }

    fn abandon_create(self: &Arc<Self>, id: SandboxId) {
        let Ok(slot) = self.slot(id) else {
            return;
        };
        tracing::warn!(sandbox_id = %id, "Create abandoned, releasing backend");
        self.advance(&slot, SandboxState::Failed, Some(Operation::Create));
        self.destroy_detached(id);
    }

    /// Run a command and wait for the result.
    pub fn execute(
        self: &Arc<Self>,
        id: SandboxId,
        command: impl Into<CommandSpec>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        self.submit_execute(id, command, timeout)?.wait()
    }

    /// Queue a command and return a handle to wait on or cancel.
    ///
    /// `timeout` defaults to the sandbox's configured limit. The wait is
    /// bounded by that timeout plus the configured slack. Cancelling or
    /// timing out a started command asks the backend to stop that command
    /// and nothing else; once it has finished, cancelling does nothing.
    pub fn submit_execute(
        self: &Arc<Self>,
        id: SandboxId,
        command: impl Into<CommandSpec>,
        timeout: Option<Duration>,
    ) -> Result<Pending<ExecutionResult>> {
        let slot = self.slot(id)?;
        let spec = command.into();
        let command = spec.command.clone();
        let provider = match self.admit(&slot, Operation::Execute) {
            Ok(p) => p,
            Err(e) => {
                self.record_rejected(&slot, &command, &e);
                return Err(e);
            }
        };
        let timeout = timeout.unwrap_or(slot.config.limits.timeout);
        if timeout.is_zero() {
            return Err(CoreError::InvalidConfig("command timeout must be non-zero".into()));
        }
        let deadline = timeout + self.settings.deadline_slack;

        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let work_slot = Arc::clone(&slot);
        let work_cancel = cancel.clone();
        let work = async move {
            let slot = work_slot;
            if let Err(e) = slot.check(Operation::Execute) {
                this.record_rejected(&slot, &spec.command, &e);
                return Err(e);
            }
            slot.touch();

            let started_at = Utc::now();
            let result = {
                let (spec, cancel) = (&spec, &work_cancel);
                this.call(&provider, id, Operation::Execute, move |p, cred| async move {
                    p.execute(id, spec, timeout, cancel, cred.as_ref()).await
                })
                .await
            };
            let finished_at = Utc::now();

            tracing::debug!(
                sandbox_id = %id,
                ok = result.is_ok(),
                elapsed_ms = (finished_at - started_at).num_milliseconds(),
                "Command finished"
            );
            this.record(
                &slot,
                HistoryEvent::Command(CommandRecord {
                    command: spec.command,
                    started_at,
                    finished_at,
                    outcome: CommandOutcome::from_result(&result),
                }),
            );
            if result.is_ok() {
                this.refresh_usage(&slot, &provider).await;
            }
            this.settle(&slot, Operation::Execute, &result);
            result
        };

        // The token belongs to this command only.
        let on_abort = move |_started: bool| async move {
            cancel.cancel();
        };

        self.bridge
            .submit_with_abort(Some(id), id.to_string(), Operation::Execute, deadline, work, on_abort)
            .map_err(|e| {
                self.record_rejected(&slot, &command, &e);
                e
            })
    }

    /// List a directory inside the sandbox.
    pub fn list_files(self: &Arc<Self>, id: SandboxId, path: &str) -> Result<Vec<FileInfo>> {
        let path = path.to_string();
        self.submit_work(id, Operation::ListFiles, move |this, _slot, provider| async move {
            let path = path.as_str();
            this.call(&provider, id, Operation::ListFiles, move |p, cred| async move {
                p.list_files(id, path, cred.as_ref()).await
            })
            .await
        })?
        .wait()
    }

    /// Write a file into the sandbox.
    pub fn upload_file(self: &Arc<Self>, id: SandboxId, path: &str, content: Vec<u8>) -> Result<()> {
        let path = path.to_string();
        self.submit_work(id, Operation::UploadFile, move |this, slot, provider| async move {
            let bytes = content.len() as u64;
            {
                let (target, data) = (path.as_str(), content.as_slice());
                this.call(&provider, id, Operation::UploadFile, move |p, cred| async move {
                    p.upload_file(id, target, data, cred.as_ref()).await
                })
                .await?;
            }
            this.record(
                &slot,
                HistoryEvent::File {
                    operation: Operation::UploadFile,
                    path,
                    bytes,
                },
            );
            Ok(())
        })?
        .wait()
    }

    /// Read a file from the sandbox.
    pub fn download_file(self: &Arc<Self>, id: SandboxId, path: &str) -> Result<Vec<u8>> {
        let path = path.to_string();
        self.submit_work(id, Operation::DownloadFile, move |this, slot, provider| async move {
            let data = {
                let target = path.as_str();
                this.call(&provider, id, Operation::DownloadFile, move |p, cred| async move {
                    p.download_file(id, target, cred.as_ref()).await
                })
                .await?
            };
            this.record(
                &slot,
                HistoryEvent::File {
                    operation: Operation::DownloadFile,
                    path,
                    bytes: data.len() as u64,
                },
            );
            Ok(data)
        })?
        .wait()
    }

    /// Capture the sandbox. Providers without snapshots return `NotSupported`.
    pub fn snapshot(self: &Arc<Self>, id: SandboxId, label: &str) -> Result<SnapshotRecord> {
        let label = label.to_string();
        self.submit_work(id, Operation::Snapshot, move |this, slot, provider| async move {
            let record = {
                let label = label.as_str();
                this.call(&provider, id, Operation::Snapshot, move |p, cred| async move {
                    p.snapshot(id, label, cred.as_ref()).await
                })
                .await?
            };
            lock(&slot.snapshots).push(record.clone());
            this.record(
                &slot,
                HistoryEvent::Snapshot {
                    operation: Operation::Snapshot,
                    snapshot: record.clone(),
                },
            );
            tracing::info!(sandbox_id = %id, snapshot = %record.id, "Snapshot taken");
            Ok(record)
        })?
        .wait()
    }

    /// Restore a snapshot into the sandbox.
    ///
    /// A snapshot from another provider is rejected before anything is
    /// dispatched.
    pub fn restore(self: &Arc<Self>, id: SandboxId, snapshot: &SnapshotRecord) -> Result<()> {
        let slot = self.slot(id)?;
        if snapshot.provider != slot.provider {
            return Err(CoreError::IncompatibleSnapshot {
                snapshot: snapshot.id.clone(),
                snapshot_provider: snapshot.provider.clone(),
                target_provider: slot.provider.clone(),
            });
        }
        let snapshot = snapshot.clone();
        self.submit_work(id, Operation::Restore, move |this, slot, provider| async move {
            {
                let record = &snapshot;
                this.call(&provider, id, Operation::Restore, move |p, cred| async move {
                    p.restore(id, record, cred.as_ref()).await
                })
                .await?;
            }
            tracing::info!(sandbox_id = %id, snapshot = %snapshot.id, "Snapshot restored");
            this.record(
                &slot,
                HistoryEvent::Snapshot {
                    operation: Operation::Restore,
                    snapshot,
                },
            );
            Ok(())
        })?
        .wait()
    }

    /// Destroy a sandbox. Destroying an already destroyed sandbox succeeds.
    pub fn destroy(self: &Arc<Self>, id: SandboxId) -> Result<()> {
        match self.submit_destroy(id)? {
            Some(pending) => pending.wait(),
            None => Ok(()),
        }
    }

    fn destroy_detached(self: &Arc<Self>, id: SandboxId) {
        match self.submit_destroy(id) {
            Ok(Some(pending)) => drop(pending),
            Ok(None) => {}
            Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "Could not queue destroy"),
        }
    }

    /// Queue a destroy. `None` means the sandbox is already gone.
    fn submit_destroy(self: &Arc<Self>, id: SandboxId) -> Result<Option<Pending<()>>> {
        let slot = match self.slot(id) {
            Ok(slot) => slot,
            Err(_) if self.is_retired(id) => return Ok(None),
            Err(e) => return Err(e),
        };
        slot.check(Operation::Destroy)?;
        // Releasing a backend does not depend on the provider's health.
        let provider = self
            .registry
            .get(&slot.provider)
            .ok_or_else(|| CoreError::ProviderUnavailable {
                provider: slot.provider.clone(),
                reason: "not registered".into(),
            })?;

        let this = Arc::clone(self);
        let work = async move {
            match slot.state() {
                SandboxState::Destroyed => return Ok(()),
                SandboxState::Failed => {}
                _ => {
                    this.advance(&slot, SandboxState::Stopping, Some(Operation::Destroy));
                }
            }

            let result = this
                .call(&provider, id, Operation::Destroy, move |p, cred| async move {
                    p.destroy(id, cred.as_ref()).await
                })
                .await;

            match result {
                Ok(()) | Err(CoreError::InstanceNotFound(_)) => {
                    this.advance(&slot, SandboxState::Destroyed, Some(Operation::Destroy));
                    this.retire(id);
                    tracing::info!(sandbox_id = %id, provider = %slot.provider, "Sandbox destroyed");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(sandbox_id = %id, error = %e, "Sandbox destroy failed");
                    this.advance(&slot, SandboxState::Failed, Some(Operation::Destroy));
                    Err(e)
                }
            }
        };

        self.bridge
            .submit(Some(id), id.to_string(), Operation::Destroy, self.settings.op_timeout, work)
            .map(Some)
    }

    /// Destroy every tracked sandbox. Returns how many were destroyed.
    pub fn destroy_all(self: &Arc<Self>) -> usize {
        let ids: Vec<SandboxId> = self.read_instances().keys().copied().collect();
        if ids.is_empty() {
            return 0;
        }
        tracing::info!(count = ids.len(), "Destroying all sandboxes");

        let pending: Vec<_> = ids
            .into_iter()
            .filter_map(|id| match self.submit_destroy(id) {
                Ok(p) => p.map(|p| (id, p)),
                Err(e) => {
                    tracing::warn!(sandbox_id = %id, error = %e, "Could not queue destroy");
                    None
                }
            })
            .collect();

        let mut destroyed = 0;
        for (id, p) in pending {
            match p.wait() {
                Ok(()) => destroyed += 1,
                Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "Destroy failed during shutdown"),
            }
        }
        destroyed
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Current lifecycle state.
    pub fn state(&self, id: SandboxId) -> Result<SandboxState> {
        Ok(self.slot(id)?.state())
    }

    /// Copy of the instance record.
    pub fn instance(&self, id: SandboxId) -> Result<SandboxInstance> {
        Ok(self.slot(id)?.instance().clone())
    }

    /// Every tracked instance, oldest first.
    pub fn list_instances(&self) -> Vec<SandboxInstance> {
        let mut list: Vec<SandboxInstance> = self
            .read_instances()
            .values()
            .map(|slot| slot.instance().clone())
            .collect();
        list.sort_by_key(|i| i.created_at);
        list
    }

    /// Number of tracked instances.
    pub fn count(&self) -> usize {
        self.read_instances().len()
    }

    /// Snapshots taken from a sandbox during its lifetime.
    pub fn list_snapshots(&self, id: SandboxId) -> Result<Vec<SnapshotRecord>> {
        Ok(lock(&self.slot(id)?.snapshots).clone())
    }

    /// Persisted history of a sandbox. Available after it is destroyed.
    pub fn history(&self, id: SandboxId) -> Result<Vec<HistoryRecord>> {
        let mut records = self.store.load_history(id)?;
        if records.is_empty() && self.slot(id).is_err() && !self.is_retired(id) {
            return Err(CoreError::InstanceNotFound(id));
        }
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    /// Delete the persisted history of a sandbox along with the stored data
    /// of every snapshot taken from it.
    ///
    /// Snapshot data outlives its sandbox so it can be restored elsewhere;
    /// this is where it is released.
    pub fn purge_history(self: &Arc<Self>, id: SandboxId) -> Result<usize> {
        let snapshots: Vec<SnapshotRecord> = self
            .store
            .load_history(id)?
            .into_iter()
            .filter_map(|r| match r.event {
                HistoryEvent::Snapshot {
                    operation: Operation::Snapshot,
                    snapshot,
                } => Some(snapshot),
                _ => None,
            })
            .collect();

        if !snapshots.is_empty() {
            let total = snapshots.len();
            let this = Arc::clone(self);
            let deleted = self.bridge.run(
                Some(id),
                id.to_string(),
                Operation::Snapshot,
                self.settings.op_timeout,
                async move { Ok(this.delete_snapshots(snapshots).await) },
            )?;
            tracing::info!(sandbox_id = %id, deleted, total, "Deleted snapshot data");
        }
        if let Ok(slot) = self.slot(id) {
            lock(&slot.snapshots).clear();
        }

        let removed = self.store.purge_history(id)?;
        tracing::info!(sandbox_id = %id, removed, "Purged sandbox history");
        Ok(removed)
    }

    async fn delete_snapshots(&self, snapshots: Vec<SnapshotRecord>) -> usize {
        let mut deleted = 0;
        for snapshot in snapshots {
            let Some(provider) = self.registry.get(&snapshot.provider) else {
                tracing::warn!(snapshot = %snapshot.id, provider = %snapshot.provider, "Snapshot provider not registered, data kept");
                continue;
            };
            let record = &snapshot;
            let result = self
                .call(&provider, snapshot.sandbox_id, Operation::Snapshot, move |p, cred| async move {
                    p.delete_snapshot(record, cred.as_ref()).await
                })
                .await;
            match result {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(snapshot = %snapshot.id, provider = %snapshot.provider, error = %e, "Failed to delete snapshot data")
                }
            }
        }
        deleted
    }

    // ------------------------------------------------------------------------
    // Idle handling
    // ------------------------------------------------------------------------

    /// Apply the idle policy once.
    ///
    /// Running sandboxes quiet for `idle_after` become Idle. Sandboxes quiet
    /// for `idle_timeout` are destroyed in the background.
    pub fn sweep(self: &Arc<Self>) -> SweepReport {
        let now = Utc::now();
        let slots: Vec<Arc<Slot>> = self.read_instances().values().cloned().collect();
        let mut report = SweepReport::default();

        for slot in slots {
            let (state, last_activity) = {
                let instance = slot.instance();
                (instance.state, instance.last_activity)
            };
            let quiet = (now - last_activity).to_std().unwrap_or_default();

            if (state.is_live() || state == SandboxState::Failed) && quiet >= self.settings.idle_timeout {
                tracing::info!(
                    sandbox_id = %slot.id,
                    state = %state,
                    idle_secs = quiet.as_secs(),
                    "Evicting idle sandbox"
                );
                self.destroy_detached(slot.id);
                report.evicted += 1;
            } else if state == SandboxState::Running
                && quiet >= self.settings.idle_after
                && self.advance(&slot, SandboxState::Idle, None)
            {
                report.idled += 1;
            }
        }

        if report != SweepReport::default() {
            tracing::debug!(idled = report.idled, evicted = report.evicted, "Sweep finished");
        }
        report
    }
}

// ============================================================================
// Tests
// ============================================================================
