//! Local provider unit: subprocesses and directories on the host.
//!
//! Each sandbox is a directory under the provider root. Paths given to the
//! file operations are resolved inside the sandbox working directory; `"/"`
//! names the working directory itself. This is path validation, not
//! isolation: commands run with the privileges of the cairn process.

use super::{cancelled, ensure_snapshot_owner, truncate_output, Provider, MAX_OUTPUT_SIZE};
use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::sandbox::{Operation, ResourceUsage, RetiredIds, SandboxId, SandboxInstance, SandboxState};
use crate::types::{
    CommandSpec, ExecutionResult, FileInfo, HealthStatus, ProviderKind, SnapshotRecord,
};
use crate::vault::Secret;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const SNAPSHOT_DIR: &str = ".snapshots";

/// Settings for a [`LocalProvider`].
#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Directory holding one subdirectory per sandbox.
    pub root: PathBuf,
    /// Max live sandboxes (0 = unlimited).
    pub max_sandboxes: usize,
    /// Max bytes per uploaded file.
    pub max_upload_bytes: u64,
}

struct LocalSandbox {
    dir: PathBuf,
    workdir: PathBuf,
    env: BTreeMap<String, String>,
}

/// Provider unit backed by the host filesystem and `sh`.
pub struct LocalProvider {
    name: String,
    settings: LocalSettings,
    sandboxes: RwLock<HashMap<SandboxId, Arc<LocalSandbox>>>,
    retired: Mutex<RetiredIds>,
}

impl LocalProvider {
    /// Create a local provider. The root directory is created lazily.
    pub fn new(name: impl Into<String>, settings: LocalSettings) -> Result<Self> {
        if settings.max_upload_bytes == 0 {
            return Err(CoreError::InvalidConfig(
                "max_upload_bytes must be > 0".into(),
            ));
        }
        Ok(Self {
            name: name.into(),
            settings,
            sandboxes: RwLock::new(HashMap::new()),
            retired: Mutex::new(RetiredIds::default()),
        })
    }

    /// Number of live sandboxes.
    pub fn live_count(&self) -> usize {
        self.sandboxes.read().map(|s| s.len()).unwrap_or(0)
    }

    fn sandbox(&self, id: SandboxId) -> Result<Arc<LocalSandbox>> {
        let sandboxes = self
            .sandboxes
            .read()
            .map_err(|_| CoreError::backend(&self.name, "sandbox table poisoned"))?;
        sandboxes
            .get(&id)
            .cloned()
            .ok_or(CoreError::InstanceNotFound(id))
    }

    fn map_io(&self, id: SandboxId, path: &str, e: io::Error) -> CoreError {
        match e.kind() {
            io::ErrorKind::NotFound => CoreError::PathNotFound {
                id,
                path: path.to_string(),
            },
            io::ErrorKind::PermissionDenied => CoreError::PermissionDenied {
                id,
                path: path.to_string(),
            },
            _ => CoreError::backend(&self.name, format!("{path}: {e}")),
        }
    }

    fn snapshot_root(&self, id: SandboxId) -> PathBuf {
        self.settings.root.join(SNAPSHOT_DIR).join(id.to_string())
    }

    /// Where the data of `snapshot` lives. The restore token must be a bare
    /// snapshot uuid; anything else is not one of ours.
    fn snapshot_dir(&self, snapshot: &SnapshotRecord) -> Result<PathBuf> {
        let token = uuid::Uuid::parse_str(&snapshot.restore_token).map_err(|_| {
            CoreError::backend(
                &self.name,
                format!("snapshot {} has an invalid restore token", snapshot.id),
            )
        })?;
        Ok(self
            .snapshot_root(snapshot.sandbox_id)
            .join(token.to_string()))
    }
}

/// Resolve a sandbox path inside `workdir`, rejecting escapes.
fn resolve(workdir: &Path, id: SandboxId, path: &str) -> Result<PathBuf> {
    let invalid = || CoreError::PathInvalid {
        id,
        path: path.to_string(),
    };
    if path.contains('\0') {
        return Err(invalid());
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(seg) => normalized.push(seg),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(invalid());
                }
            }
            Component::CurDir | Component::RootDir => {}
            Component::Prefix(_) => return Err(invalid()),
        }
    }
    Ok(workdir.join(normalized))
}

fn relative_display(workdir: &Path, path: &Path) -> String {
    path.strip_prefix(workdir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn modified(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<u64> {
    std::fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            copied += std::fs::copy(entry.path(), &target)?;
        } else {
            trace!(path = %entry.path().display(), "Skipping special file in snapshot");
        }
    }
    Ok(copied)
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| match e.metadata() {
            Ok(m) if m.is_dir() => dir_size(&e.path()),
            Ok(m) => m.len(),
            Err(_) => 0,
        })
        .sum()
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn create(
        &self,
        id: SandboxId,
        config: &SandboxConfig,
        _credential: Option<&Secret>,
    ) -> Result<SandboxInstance> {
        config.validate()?;
        let dir = self.settings.root.join(id.to_string());
        let workdir = dir.join(config.working_dir.trim_start_matches('/'));

        {
            let sandboxes = self
                .sandboxes
                .read()
                .map_err(|_| CoreError::backend(&self.name, "sandbox table poisoned"))?;
            if sandboxes.contains_key(&id) {
                return Err(CoreError::InvalidConfig(format!("sandbox {id} already exists")));
            }
            let max = self.settings.max_sandboxes;
            if max > 0 && sandboxes.len() >= max {
                return Err(CoreError::QuotaExceeded {
                    provider: self.name.clone(),
                    detail: format!("max sandbox limit reached ({max})"),
                });
            }
        }

        tokio::fs::create_dir_all(&workdir).await.map_err(|e| {
            CoreError::backend(
                &self.name,
                format!("failed to create {}: {e}", workdir.display()),
            )
        })?;

        let sandbox = Arc::new(LocalSandbox {
            dir,
            workdir,
            env: config.env.clone(),
        });
        self.sandboxes
            .write()
            .map_err(|_| CoreError::backend(&self.name, "sandbox table poisoned"))?
            .insert(id, sandbox);

        info!(sandbox_id = %id, provider = %self.name, working_dir = %config.working_dir, "Local sandbox created");

        let mut instance = SandboxInstance::requested(id, &self.name);
        instance.state = SandboxState::Ready;
        Ok(instance)
    }

    async fn execute(
        &self,
        id: SandboxId,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancellationToken,
        _credential: Option<&Secret>,
    ) -> Result<ExecutionResult> {
        let sandbox = self.sandbox(id)?;
        if cancel.is_cancelled() {
            return Err(cancelled(id));
        }
        let cwd = match spec.working_dir.as_deref() {
            Some(dir) => {
                let cwd = resolve(&sandbox.workdir, id, dir)?;
                let meta = tokio::fs::metadata(&cwd)
                    .await
                    .map_err(|e| self.map_io(id, dir, e))?;
                if !meta.is_dir() {
                    return Err(CoreError::PathInvalid {
                        id,
                        path: dir.to_string(),
                    });
                }
                cwd
            }
            None => sandbox.workdir.clone(),
        };
        debug!(sandbox_id = %id, cmd = %spec.command, cwd = %cwd.display(), "executing shell command");

        // Per-call variables win over the sandbox environment.
        let child = Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&cwd)
            .envs(&sandbox.env)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::backend(&self.name, format!("failed to spawn sh: {e}")))?;

        let start = Instant::now();
        let output = tokio::select! {
            out = child.wait_with_output() => out
                .map_err(|e| CoreError::backend(&self.name, format!("command failed: {e}")))?,
            _ = tokio::time::sleep(timeout) => {
                warn!(sandbox_id = %id, timeout_ms = timeout.as_millis() as u64, "Command timed out, killed");
                return Err(CoreError::Timeout {
                    target: id.to_string(),
                    operation: Operation::Execute,
                    after: timeout,
                });
            }
            _ = cancel.cancelled() => {
                info!(sandbox_id = %id, "Command cancelled, killed");
                return Err(cancelled(id));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = truncate_output(
            String::from_utf8_lossy(&output.stdout).into_owned(),
            MAX_OUTPUT_SIZE,
        );
        let stderr = truncate_output(
            String::from_utf8_lossy(&output.stderr).into_owned(),
            MAX_OUTPUT_SIZE,
        );
        debug!(
            sandbox_id = %id,
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "command completed"
        );
        trace!(stdout = %stdout, stderr = %stderr, "command output");
        Ok(ExecutionResult::new(exit_code, stdout, stderr, start.elapsed()))
    }

    async fn list_files(
        &self,
        id: SandboxId,
        path: &str,
        _credential: Option<&Secret>,
    ) -> Result<Vec<FileInfo>> {
        let sandbox = self.sandbox(id)?;
        let target = resolve(&sandbox.workdir, id, path)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| self.map_io(id, path, e))?;

        if !meta.is_dir() {
            return Ok(vec![FileInfo {
                path: relative_display(&sandbox.workdir, &target),
                size: meta.len(),
                is_dir: false,
                modified: modified(&meta),
            }]);
        }

        let mut entries = tokio::fs::read_dir(&target)
            .await
            .map_err(|e| self.map_io(id, path, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.map_io(id, path, e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| self.map_io(id, path, e))?;
            files.push(FileInfo {
                path: relative_display(&sandbox.workdir, &entry.path()),
                size: if meta.is_file() { meta.len() } else { 0 },
                is_dir: meta.is_dir(),
                modified: modified(&meta),
            });
        }

        // Sort by name for consistent output
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn upload_file(
        &self,
        id: SandboxId,
        path: &str,
        content: &[u8],
        _credential: Option<&Secret>,
    ) -> Result<()> {
        let sandbox = self.sandbox(id)?;
        let max = self.settings.max_upload_bytes;
        if content.len() as u64 > max {
            return Err(CoreError::QuotaExceeded {
                provider: self.name.clone(),
                detail: format!(
                    "file {path} is too large ({} bytes, max {max} bytes)",
                    content.len()
                ),
            });
        }

        let target = resolve(&sandbox.workdir, id, path)?;
        if target == sandbox.workdir {
            return Err(CoreError::PathInvalid {
                id,
                path: path.to_string(),
            });
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.map_io(id, path, e))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| self.map_io(id, path, e))?;
        debug!(sandbox_id = %id, path = %path, bytes = content.len(), "File written");
        Ok(())
    }

    async fn download_file(
        &self,
        id: SandboxId,
        path: &str,
        _credential: Option<&Secret>,
    ) -> Result<Vec<u8>> {
        let sandbox = self.sandbox(id)?;
        let target = resolve(&sandbox.workdir, id, path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| self.map_io(id, path, e))
    }

    async fn snapshot(
        &self,
        id: SandboxId,
        label: &str,
        _credential: Option<&Secret>,
    ) -> Result<SnapshotRecord> {
        let sandbox = self.sandbox(id)?;
        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let dest = self.snapshot_root(id).join(&snapshot_id);

        let from = sandbox.workdir.clone();
        let to = dest.clone();
        let bytes = tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| CoreError::backend(&self.name, format!("snapshot task failed: {e}")))?
            .map_err(|e| CoreError::backend(&self.name, format!("snapshot copy failed: {e}")))?;

        info!(sandbox_id = %id, snapshot_id = %snapshot_id, bytes, "Local snapshot taken");
        Ok(SnapshotRecord {
            id: snapshot_id.clone(),
            sandbox_id: id,
            provider: self.name.clone(),
            label: label.to_string(),
            created_at: Utc::now(),
            restore_token: snapshot_id,
        })
    }

    async fn restore(
        &self,
        id: SandboxId,
        snapshot: &SnapshotRecord,
        _credential: Option<&Secret>,
    ) -> Result<()> {
        ensure_snapshot_owner(self, snapshot)?;
        let sandbox = self.sandbox(id)?;

        let source = self.snapshot_dir(snapshot)?;
        if !source.is_dir() {
            return Err(CoreError::backend(
                &self.name,
                format!("snapshot {} data is missing", snapshot.id),
            ));
        }

        let workdir = sandbox.workdir.clone();
        tokio::task::spawn_blocking(move || {
            clear_dir(&workdir)?;
            copy_tree(&source, &workdir)
        })
        .await
        .map_err(|e| CoreError::backend(&self.name, format!("restore task failed: {e}")))?
        .map_err(|e| CoreError::backend(&self.name, format!("restore copy failed: {e}")))?;

        info!(sandbox_id = %id, snapshot_id = %snapshot.id, "Local snapshot restored");
        Ok(())
    }

    async fn destroy(&self, id: SandboxId, _credential: Option<&Secret>) -> Result<()> {
        let removed = self
            .sandboxes
            .write()
            .map_err(|_| CoreError::backend(&self.name, "sandbox table poisoned"))?
            .remove(&id);

        let Some(sandbox) = removed else {
            let retired = self
                .retired
                .lock()
                .map(|r| r.contains(&id))
                .unwrap_or(false);
            return if retired {
                debug!(sandbox_id = %id, "Local sandbox already destroyed");
                Ok(())
            } else {
                Err(CoreError::InstanceNotFound(id))
            };
        };

        if let Ok(mut retired) = self.retired.lock() {
            retired.insert(id);
        }
        match tokio::fs::remove_dir_all(&sandbox.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(sandbox_id = %id, error = %e, "Failed to remove sandbox directory");
            }
        }
        info!(sandbox_id = %id, provider = %self.name, "Local sandbox destroyed");
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        snapshot: &SnapshotRecord,
        _credential: Option<&Secret>,
    ) -> Result<()> {
        ensure_snapshot_owner(self, snapshot)?;
        let dir = self.snapshot_dir(snapshot)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CoreError::backend(
                    &self.name,
                    format!("failed to delete snapshot {}: {e}", snapshot.id),
                ))
            }
        }
        // Drop the per-sandbox directory once its last snapshot is gone.
        let _ = tokio::fs::remove_dir(self.snapshot_root(snapshot.sandbox_id)).await;
        debug!(sandbox_id = %snapshot.sandbox_id, snapshot_id = %snapshot.id, "Local snapshot deleted");
        Ok(())
    }

    async fn usage(&self, id: SandboxId) -> Result<ResourceUsage> {
        let sandbox = self.sandbox(id)?;
        let workdir = sandbox.workdir.clone();
        let disk = tokio::task::spawn_blocking(move || dir_size(&workdir))
            .await
            .map_err(|e| CoreError::backend(&self.name, format!("usage task failed: {e}")))?;
        Ok(ResourceUsage {
            disk_bytes: Some(disk),
            ..ResourceUsage::default()
        })
    }

    async fn health_check(&self, _credential: Option<&Secret>) -> HealthStatus {
        if let Err(e) = tokio::fs::create_dir_all(&self.settings.root).await {
            return HealthStatus::Unavailable(format!(
                "cannot create {}: {e}",
                self.settings.root.display()
            ));
        }
        let max = self.settings.max_sandboxes;
        if max > 0 && self.live_count() >= max {
            return HealthStatus::Degraded(format!("at sandbox limit ({max})"));
        }
        HealthStatus::Available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(root: &Path) -> LocalProvider {
        LocalProvider::new(
            "local",
            LocalSettings {
                root: root.to_path_buf(),
                max_sandboxes: 2,
                max_upload_bytes: 16,
            },
        )
        .unwrap()
    }

    async fn run(
        p: &LocalProvider,
        id: SandboxId,
        command: impl Into<CommandSpec>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        p.execute(id, &command.into(), timeout, &CancellationToken::new(), None)
            .await
    }

    fn config() -> SandboxConfig {
        SandboxConfig::builder()
            .working_dir("/tmp/ws")
            .env("GREETING", "hello")
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolve_stays_inside_workdir() {
        let id = SandboxId::new();
        let wd = Path::new("/srv/ws");
        assert_eq!(resolve(wd, id, "/").unwrap(), PathBuf::from("/srv/ws"));
        assert_eq!(resolve(wd, id, "a.txt").unwrap(), PathBuf::from("/srv/ws/a.txt"));
        assert_eq!(resolve(wd, id, "/x/../b").unwrap(), PathBuf::from("/srv/ws/b"));
        assert!(matches!(
            resolve(wd, id, "../etc/passwd"),
            Err(CoreError::PathInvalid { .. })
        ));
        assert!(resolve(wd, id, "a\0b").is_err());
    }

    #[tokio::test]
    async fn test_execute_in_working_dir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();

        let result = run(&p, id, "echo $GREETING; pwd", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.success);
        let mut lines = result.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        assert!(lines.next().unwrap().ends_with("/tmp/ws"));
    }

    #[tokio::test]
    async fn test_execute_exit_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();

        let result = run(&p, id, "echo oops >&2; exit 3", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success);
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();

        let start = Instant::now();
        let err = run(&p, id, "sleep 5", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_files_roundtrip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();

        p.upload_file(id, "a.txt", b"data", None).await.unwrap();
        p.upload_file(id, "/sub/b.txt", b"xy", None).await.unwrap();
        assert_eq!(p.download_file(id, "/a.txt", None).await.unwrap(), b"data");

        let files = p.list_files(id, "/", None).await.unwrap();
        let a = files.iter().find(|f| f.path == "a.txt").unwrap();
        assert_eq!(a.size, 4);
        assert!(!a.is_dir);
        let sub = files.iter().find(|f| f.path == "sub").unwrap();
        assert!(sub.is_dir);

        let nested = p.list_files(id, "sub", None).await.unwrap();
        assert_eq!(nested[0].path, "sub/b.txt");
    }

    #[tokio::test]
    async fn test_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();

        assert!(matches!(
            p.download_file(id, "missing.txt", None).await,
            Err(CoreError::PathNotFound { .. })
        ));
        assert!(matches!(
            p.list_files(id, "nope", None).await,
            Err(CoreError::PathNotFound { .. })
        ));
        assert!(matches!(
            p.upload_file(id, "../escape.txt", b"x", None).await,
            Err(CoreError::PathInvalid { .. })
        ));
        assert!(matches!(
            p.upload_file(id, "big.bin", &[0u8; 17], None).await,
            Err(CoreError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();

        p.upload_file(id, "keep.txt", b"v1", None).await.unwrap();
        let snap = p.snapshot(id, "before", None).await.unwrap();
        assert_eq!(snap.provider, "local");
        assert_eq!(snap.label, "before");

        p.upload_file(id, "keep.txt", b"v2", None).await.unwrap();
        p.upload_file(id, "extra.txt", b"new", None).await.unwrap();
        p.restore(id, &snap, None).await.unwrap();

        let files = p.list_files(id, "/", None).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(names, vec!["keep.txt"]);
        assert_eq!(p.download_file(id, "keep.txt", None).await.unwrap(), b"v1");
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();

        let mut snap = p.snapshot(id, "s", None).await.unwrap();
        snap.provider = "morph".into();
        assert!(matches!(
            p.restore(id, &snap, None).await,
            Err(CoreError::IncompatibleSnapshot { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();
        let sandbox_dir = dir.path().join(id.to_string());
        assert!(sandbox_dir.exists());

        p.destroy(id, None).await.unwrap();
        assert!(!sandbox_dir.exists());
        p.destroy(id, None).await.unwrap();
        assert!(matches!(
            p.destroy(SandboxId::new(), None).await,
            Err(CoreError::InstanceNotFound(_))
        ));
        assert!(matches!(
            run(&p, id, "true", Duration::from_secs(1)).await,
            Err(CoreError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sandbox_quota() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        p.create(SandboxId::new(), &config(), None).await.unwrap();
        p.create(SandboxId::new(), &config(), None).await.unwrap();
        assert!(matches!(
            p.create(SandboxId::new(), &config(), None).await,
            Err(CoreError::QuotaExceeded { .. })
        ));
        assert!(matches!(
            p.health_check(None).await,
            HealthStatus::Degraded(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_kills_only_its_own_command() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(provider(dir.path()));
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();

        let token = CancellationToken::new();
        let runner = Arc::clone(&p);
        let runner_token = token.clone();
        let handle = tokio::spawn(async move {
            runner
                .execute(id, &CommandSpec::new("sleep 10"), Duration::from_secs(30), &runner_token, None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CoreError::Cancelled { .. })));

        // A fresh call is not touched by the old token.
        let after = run(&p, id, "sleep 0.2; echo ok", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(after.stdout, "ok\n");

        // An already fired token stops the call before it spawns.
        assert!(matches!(
            p.execute(id, &CommandSpec::new("echo never"), Duration::from_secs(5), &token, None)
                .await,
            Err(CoreError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_with_working_dir_and_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();
        p.upload_file(id, "sub/marker", b"x", None).await.unwrap();

        let spec = CommandSpec::new("pwd; echo $GREETING $EXTRA")
            .working_dir("/sub")
            .env("GREETING", "hi")
            .env("EXTRA", "there");
        let result = run(&p, id, spec, Duration::from_secs(10)).await.unwrap();
        let mut lines = result.stdout.lines();
        assert!(lines.next().unwrap().ends_with("/tmp/ws/sub"));
        assert_eq!(lines.next(), Some("hi there"));

        // The overrides do not stick to the sandbox.
        let plain = run(&p, id, "echo $GREETING", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(plain.stdout, "hello\n");

        assert!(matches!(
            run(&p, id, CommandSpec::new("pwd").working_dir("../.."), Duration::from_secs(5)).await,
            Err(CoreError::PathInvalid { .. })
        ));
        assert!(matches!(
            run(&p, id, CommandSpec::new("pwd").working_dir("missing"), Duration::from_secs(5)).await,
            Err(CoreError::PathNotFound { .. })
        ));
        assert!(matches!(
            run(&p, id, CommandSpec::new("pwd").working_dir("sub/marker"), Duration::from_secs(5)).await,
            Err(CoreError::PathInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_restore_rejects_forged_token() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(&dir.path().join("root"));
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();
        p.upload_file(id, "keep.txt", b"mine", None).await.unwrap();

        let outside = dir.path().join("host_secret");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), b"leak").unwrap();

        let mut snap = p.snapshot(id, "s", None).await.unwrap();
        assert!(uuid::Uuid::parse_str(&snap.restore_token).is_ok());
        for forged in [
            format!("{}/../../../host_secret", snap.restore_token),
            "../../host_secret".to_string(),
            outside.to_string_lossy().into_owned(),
        ] {
            snap.restore_token = forged;
            assert!(matches!(
                p.restore(id, &snap, None).await,
                Err(CoreError::BackendFailure { .. })
            ));
        }

        assert_eq!(p.download_file(id, "keep.txt", None).await.unwrap(), b"mine");
        assert!(matches!(
            p.download_file(id, "secret.txt", None).await,
            Err(CoreError::PathNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_snapshot_removes_data() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();
        p.upload_file(id, "a.txt", b"data", None).await.unwrap();

        let first = p.snapshot(id, "one", None).await.unwrap();
        let second = p.snapshot(id, "two", None).await.unwrap();
        let root = dir.path().join(SNAPSHOT_DIR).join(id.to_string());
        assert!(root.join(&first.restore_token).is_dir());

        p.delete_snapshot(&first, None).await.unwrap();
        assert!(!root.join(&first.restore_token).exists());
        assert!(root.join(&second.restore_token).is_dir());
        // Already gone is fine.
        p.delete_snapshot(&first, None).await.unwrap();

        p.delete_snapshot(&second, None).await.unwrap();
        assert!(!root.exists());
        assert!(p.restore(id, &second, None).await.is_err());
    }

    #[tokio::test]
    async fn test_usage_reports_disk_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let id = SandboxId::new();
        p.create(id, &config(), None).await.unwrap();
        p.upload_file(id, "a.txt", b"data", None).await.unwrap();
        assert_eq!(p.usage(id).await.unwrap().disk_bytes, Some(4));
    }
}
