//! Provider capability contract and the provider units that implement it.
//!
//! A provider owns the backend-side handle for each sandbox it created,
//! keyed by [`SandboxId`]. The lifecycle manager owns the instance record and
//! decides when a provider is called; providers never change lifecycle state.

mod local;
mod remote;

pub use local::{LocalProvider, LocalSettings};
pub use remote::RemoteProvider;

use crate::config::{CairnConfig, ProviderSettings, SandboxConfig};
use crate::error::{CoreError, Result};
use crate::sandbox::{Operation, ResourceUsage, SandboxId, SandboxInstance};
use crate::types::{
    CommandSpec, ExecutionResult, FileInfo, HealthStatus, ProviderKind, SnapshotRecord,
};
use crate::vault::Secret;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum bytes kept per output stream.
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Capabilities every provider unit implements.
///
/// `credential` is the decrypted secret for this provider, or `None` for
/// providers that need none. It must not outlive the call.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Backend family.
    fn kind(&self) -> ProviderKind;

    /// Provision a backend sandbox for `id`.
    async fn create(
        &self,
        id: SandboxId,
        config: &SandboxConfig,
        credential: Option<&Secret>,
    ) -> Result<SandboxInstance>;

    /// Run a shell command.
    ///
    /// `cancel` belongs to this one call. When it fires the provider stops
    /// this command and returns `Cancelled`; it never affects other calls.
    async fn execute(
        &self,
        id: SandboxId,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
        credential: Option<&Secret>,
    ) -> Result<ExecutionResult>;

    /// List a directory.
    async fn list_files(
        &self,
        id: SandboxId,
        path: &str,
        credential: Option<&Secret>,
    ) -> Result<Vec<FileInfo>>;

    /// Write a file, creating parent directories.
    async fn upload_file(
        &self,
        id: SandboxId,
        path: &str,
        content: &[u8],
        credential: Option<&Secret>,
    ) -> Result<()>;

    /// Read a file.
    async fn download_file(
        &self,
        id: SandboxId,
        path: &str,
        credential: Option<&Secret>,
    ) -> Result<Vec<u8>>;

    /// Capture the sandbox state.
    async fn snapshot(
        &self,
        id: SandboxId,
        label: &str,
        credential: Option<&Secret>,
    ) -> Result<SnapshotRecord>;

    /// Restore a snapshot this provider produced.
    async fn restore(
        &self,
        id: SandboxId,
        snapshot: &SnapshotRecord,
        credential: Option<&Secret>,
    ) -> Result<()>;

    /// Release the backend handle. Destroying an already destroyed sandbox
    /// succeeds.
    async fn destroy(&self, id: SandboxId, credential: Option<&Secret>) -> Result<()>;

    /// Delete the stored data of a snapshot this provider produced.
    /// Deleting a snapshot that is already gone succeeds.
    async fn delete_snapshot(
        &self,
        _snapshot: &SnapshotRecord,
        _credential: Option<&Secret>,
    ) -> Result<()> {
        Ok(())
    }

    /// Resources the sandbox currently uses, as far as the backend reports.
    async fn usage(&self, _id: SandboxId) -> Result<ResourceUsage> {
        Ok(ResourceUsage::default())
    }

    /// Probe the backend.
    async fn health_check(&self, credential: Option<&Secret>) -> HealthStatus;
}

/// Check that a snapshot belongs to `provider` before handing it to a backend.
pub(crate) fn ensure_snapshot_owner(provider: &dyn Provider, snapshot: &SnapshotRecord) -> Result<()> {
    if snapshot.provider != provider.name() {
        return Err(CoreError::IncompatibleSnapshot {
            snapshot: snapshot.id.clone(),
            snapshot_provider: snapshot.provider.clone(),
            target_provider: provider.name().to_string(),
        });
    }
    Ok(())
}

/// Error for a call whose cancel token fired.
pub(crate) fn cancelled(id: SandboxId) -> CoreError {
    CoreError::Cancelled {
        target: id.to_string(),
        operation: Operation::Execute,
    }
}

pub(crate) fn not_supported(provider: &str, operation: Operation) -> CoreError {
    CoreError::NotSupported {
        provider: provider.to_string(),
        operation,
    }
}

/// Truncate a string to max bytes, preserving UTF-8 boundaries.
pub(crate) fn truncate_output(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_string();
    truncated.push_str("\n... [output truncated]");
    truncated
}

/// Build the provider unit described by `settings`.
pub fn build_provider(
    name: &str,
    settings: &ProviderSettings,
    config: &CairnConfig,
) -> Result<Arc<dyn Provider>> {
    match settings.kind {
        ProviderKind::Local => Ok(Arc::new(LocalProvider::new(
            name,
            LocalSettings {
                root: config.local_root.join(name),
                max_sandboxes: config.local_max_sandboxes,
                max_upload_bytes: config.max_upload_bytes,
            },
        )?)),
        kind => {
            let endpoint = settings.endpoint.as_deref().ok_or_else(|| {
                CoreError::InvalidConfig(format!("provider {name} requires an endpoint"))
            })?;
            Ok(Arc::new(RemoteProvider::new(
                name,
                kind,
                endpoint,
                settings.template.clone(),
                config.op_timeout,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_output_short() {
        assert_eq!(truncate_output("hello".into(), 10), "hello");
    }

    #[test]
    fn test_truncate_output_respects_char_boundary() {
        let s = "é".repeat(10);
        let out = truncate_output(s, 5);
        assert!(out.starts_with("éé"));
        assert!(out.ends_with("[output truncated]"));
    }

    #[test]
    fn test_build_remote_requires_endpoint() {
        let config = CairnConfig::default();
        let settings = ProviderSettings::new(ProviderKind::E2b);
        assert!(matches!(
            build_provider("e2b", &settings, &config),
            Err(CoreError::InvalidConfig(_))
        ));
    }
}
