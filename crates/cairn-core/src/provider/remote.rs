//! Remote provider unit for cloud backends.
//!
//! Every cloud kind is driven through the same JSON-over-HTTPS shape against
//! its configured endpoint, authenticated with the provider credential as a
//! bearer token:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create | `POST /sandboxes` |
//! | execute | `POST /sandboxes/{rid}/exec` |
//! | cancel an execute | `POST /sandboxes/{rid}/cancel` |
//! | list files | `GET /sandboxes/{rid}/files?path=` |
//! | upload | `PUT /sandboxes/{rid}/files?path=` |
//! | download | `GET /sandboxes/{rid}/files/content?path=` |
//! | snapshot | `POST /sandboxes/{rid}/snapshots` |
//! | restore | `POST /sandboxes/{rid}/restore` |
//! | delete snapshot | `DELETE /snapshots/{snapshot_id}` |
//! | destroy | `DELETE /sandboxes/{rid}` |
//! | health | `GET /health` |
//!
//! `rid` is the backend's own identifier, returned by create. Every exec
//! carries a fresh `operation_id`; a cancel names that id so the backend
//! stops only the command it belongs to.

use super::{
    cancelled, ensure_snapshot_owner, not_supported, truncate_output, Provider, MAX_OUTPUT_SIZE,
};
use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::sandbox::{Operation, RetiredIds, SandboxId, SandboxInstance, SandboxState};
use crate::types::{
    CommandSpec, ExecutionResult, FileInfo, HealthStatus, ProviderKind, SnapshotRecord,
};
use crate::vault::Secret;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Extra time granted to the HTTP request beyond the command timeout.
const EXEC_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    sandbox_id: SandboxId,
    template: Option<&'a str>,
    cpu: f32,
    memory_mib: u32,
    timeout_secs: u64,
    working_dir: &'a str,
    env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    remote_id: String,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    operation_id: &'a str,
    command: &'a str,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    operation_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RemoteFile {
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    is_dir: bool,
    modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct SnapshotRequest<'a> {
    label: &'a str,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    snapshot_id: String,
}

#[derive(Debug, Serialize)]
struct RestoreRequest<'a> {
    snapshot_id: &'a str,
}

/// What a request was about, for error mapping.
#[derive(Clone, Copy)]
struct Call<'a> {
    id: Option<SandboxId>,
    operation: Operation,
    path: Option<&'a str>,
}

/// Provider unit speaking JSON over HTTP(S) to a cloud backend.
pub struct RemoteProvider {
    name: String,
    kind: ProviderKind,
    endpoint: String,
    template: Option<String>,
    request_timeout: Duration,
    http: reqwest::Client,
    handles: RwLock<HashMap<SandboxId, String>>,
    retired: Mutex<RetiredIds>,
}

impl RemoteProvider {
    /// Create a remote provider for `kind` at `endpoint`.
    pub fn new(
        name: impl Into<String>,
        kind: ProviderKind,
        endpoint: &str,
        template: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        if kind == ProviderKind::Local {
            return Err(CoreError::InvalidConfig(format!(
                "provider {name}: local kind has no remote endpoint"
            )));
        }
        let endpoint = endpoint.trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(CoreError::InvalidConfig(format!(
                "provider {name}: endpoint must be an http(s) URL: {endpoint}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CoreError::InvalidConfig(format!("provider {name}: {e}")))?;

        tracing::debug!(provider = %name, kind = %kind, endpoint = %endpoint, "Remote provider configured");
        Ok(Self {
            name,
            kind,
            endpoint,
            template,
            request_timeout,
            http,
            handles: RwLock::new(HashMap::new()),
            retired: Mutex::new(RetiredIds::default()),
        })
    }

    fn remote_id(&self, id: SandboxId) -> Result<String> {
        self.handles
            .read()
            .map_err(|_| CoreError::backend(&self.name, "handle table poisoned"))?
            .get(&id)
            .cloned()
            .ok_or(CoreError::InstanceNotFound(id))
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        credential: Option<&Secret>,
    ) -> Result<RequestBuilder> {
        let url = format!("{}{}", self.endpoint, path);
        let builder = self.http.request(method, url);
        match credential {
            Some(secret) => Ok(builder.bearer_auth(secret.expose())),
            None if self.kind.requires_credential() => Err(CoreError::CredentialUnavailable {
                provider: self.name.clone(),
            }),
            None => Ok(builder),
        }
    }

    async fn send(&self, builder: RequestBuilder, call: Call<'_>, deadline: Duration) -> Result<Response> {
        let start = Instant::now();
        let target = call
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| self.name.clone());

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CoreError::Timeout {
                    target: target.clone(),
                    operation: call.operation,
                    after: deadline,
                }
            } else {
                CoreError::transient(&self.name, format!("{} request failed: {e}", call.operation))
            }
        })?;

        let status = response.status();
        tracing::debug!(
            provider = %self.name,
            operation = %call.operation,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Backend responded"
        );
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = truncate_output(format!("{} returned {status}: {body}", call.operation), 512);
        Err(self.map_status(status.as_u16(), detail, call, target, deadline))
    }

    fn map_status(
        &self,
        status: u16,
        detail: String,
        call: Call<'_>,
        target: String,
        deadline: Duration,
    ) -> CoreError {
        let provider = self.name.clone();
        match (status, call.id, call.path) {
            (401 | 403, _, _) => CoreError::CredentialUnavailable { provider },
            (404, Some(id), Some(path)) => CoreError::PathNotFound {
                id,
                path: path.to_string(),
            },
            (404, Some(id), None) => CoreError::InstanceNotFound(id),
            (409, Some(id), _) => CoreError::InstanceNotRunning(id),
            (400 | 422, Some(id), Some(path)) => CoreError::PathInvalid {
                id,
                path: path.to_string(),
            },
            (400 | 422, _, _) => CoreError::InvalidConfig(detail),
            (402 | 413 | 507, _, _) => CoreError::QuotaExceeded { provider, detail },
            (408 | 504, _, _) => CoreError::Timeout {
                target,
                operation: call.operation,
                after: deadline,
            },
            (501, _, _) => not_supported(&self.name, call.operation),
            (429, _, _) | (500..=599, _, _) => CoreError::transient(provider, detail),
            _ => CoreError::backend(provider, detail),
        }
    }

    /// Ask the backend to stop one exec call whose request was dropped.
    async fn cancel_operation(
        &self,
        id: SandboxId,
        rid: &str,
        operation_id: &str,
        credential: Option<&Secret>,
    ) {
        let call = Call {
            id: Some(id),
            operation: Operation::Cancel,
            path: None,
        };
        let builder = match self.request(Method::POST, &format!("/sandboxes/{rid}/cancel"), credential) {
            Ok(b) => b.json(&CancelRequest { operation_id }),
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Cannot cancel backend command");
                return;
            }
        };
        match self.send(builder, call, self.request_timeout).await {
            Ok(_) => {
                tracing::info!(sandbox_id = %id, provider = %self.name, operation_id, "Cancelled backend command")
            }
            Err(CoreError::NotSupported { .. }) => {
                tracing::debug!(sandbox_id = %id, provider = %self.name, "Backend cannot cancel");
            }
            Err(e) => tracing::warn!(sandbox_id = %id, operation_id, error = %e, "Backend cancel failed"),
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, response: Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| CoreError::backend(&self.name, format!("malformed response: {e}")))
    }
}

#[async_trait]
impl Provider for RemoteProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create(
        &self,
        id: SandboxId,
        config: &SandboxConfig,
        credential: Option<&Secret>,
    ) -> Result<SandboxInstance> {
        config.validate()?;
        let body = CreateRequest {
            sandbox_id: id,
            template: config.template.as_deref().or(self.template.as_deref()),
            cpu: config.limits.cpu,
            memory_mib: config.limits.memory_mib,
            timeout_secs: config.limits.timeout.as_secs(),
            working_dir: &config.working_dir,
            env: &config.env,
        };
        let call = Call {
            id: None,
            operation: Operation::Create,
            path: None,
        };
        let builder = self.request(Method::POST, "/sandboxes", credential)?.json(&body);
        let response = self.send(builder, call, self.request_timeout).await?;
        let created: CreateResponse = self.json(response).await?;

        self.handles
            .write()
            .map_err(|_| CoreError::backend(&self.name, "handle table poisoned"))?
            .insert(id, created.remote_id.clone());
        tracing::info!(sandbox_id = %id, provider = %self.name, remote_id = %created.remote_id, "Remote sandbox created");

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
        credential: Option<&Secret>,
    ) -> Result<ExecutionResult> {
        let rid = self.remote_id(id)?;
        if cancel.is_cancelled() {
            return Err(cancelled(id));
        }
        let deadline = timeout + EXEC_SLACK;
        let operation_id = uuid::Uuid::new_v4().to_string();
        let body = ExecRequest {
            operation_id: &operation_id,
            command: &spec.command,
            timeout_ms: timeout.as_millis() as u64,
            working_dir: spec.working_dir.as_deref(),
            env: &spec.env,
        };
        let call = Call {
            id: Some(id),
            operation: Operation::Execute,
            path: None,
        };
        let start = Instant::now();
        let builder = self
            .request(Method::POST, &format!("/sandboxes/{rid}/exec"), credential)?
            .timeout(deadline)
            .json(&body);
        let response = tokio::select! {
            response = self.send(builder, call, deadline) => response?,
            _ = cancel.cancelled() => {
                self.cancel_operation(id, &rid, &operation_id, credential).await;
                return Err(cancelled(id));
            }
        };
        let out: ExecResponse = self.json(response).await?;

        let duration = out
            .duration_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| start.elapsed());
        Ok(ExecutionResult::new(
            out.exit_code,
            truncate_output(out.stdout, MAX_OUTPUT_SIZE),
            truncate_output(out.stderr, MAX_OUTPUT_SIZE),
            duration,
        ))
    }

    async fn list_files(
        &self,
        id: SandboxId,
        path: &str,
        credential: Option<&Secret>,
    ) -> Result<Vec<FileInfo>> {
        let rid = self.remote_id(id)?;
        let call = Call {
            id: Some(id),
            operation: Operation::ListFiles,
            path: Some(path),
        };
        let builder = self
            .request(Method::GET, &format!("/sandboxes/{rid}/files"), credential)?
            .query(&[("path", path)]);
        let response = self.send(builder, call, self.request_timeout).await?;
        let files: Vec<RemoteFile> = self.json(response).await?;

        let mut files: Vec<FileInfo> = files
            .into_iter()
            .map(|f| FileInfo {
                path: f.path,
                size: f.size,
                is_dir: f.is_dir,
                modified: f.modified.unwrap_or_else(Utc::now),
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn upload_file(
        &self,
        id: SandboxId,
        path: &str,
        content: &[u8],
        credential: Option<&Secret>,
    ) -> Result<()> {
        let rid = self.remote_id(id)?;
        let call = Call {
            id: Some(id),
            operation: Operation::UploadFile,
            path: Some(path),
        };
        let builder = self
            .request(Method::PUT, &format!("/sandboxes/{rid}/files"), credential)?
            .query(&[("path", path)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content.to_vec());
        self.send(builder, call, self.request_timeout).await?;
        Ok(())
    }

    async fn download_file(
        &self,
        id: SandboxId,
        path: &str,
        credential: Option<&Secret>,
    ) -> Result<Vec<u8>> {
        let rid = self.remote_id(id)?;
        let call = Call {
            id: Some(id),
            operation: Operation::DownloadFile,
            path: Some(path),
        };
        let builder = self
            .request(
                Method::GET,
                &format!("/sandboxes/{rid}/files/content"),
                credential,
            )?
            .query(&[("path", path)]);
        let response = self.send(builder, call, self.request_timeout).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::transient(&self.name, format!("download interrupted: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn snapshot(
        &self,
        id: SandboxId,
        label: &str,
        credential: Option<&Secret>,
    ) -> Result<SnapshotRecord> {
        if !self.kind.supports_snapshots() {
            return Err(not_supported(&self.name, Operation::Snapshot));
        }
        let rid = self.remote_id(id)?;
        let call = Call {
            id: Some(id),
            operation: Operation::Snapshot,
            path: None,
        };
        let builder = self
            .request(Method::POST, &format!("/sandboxes/{rid}/snapshots"), credential)?
            .json(&SnapshotRequest { label });
        let response = self.send(builder, call, self.request_timeout).await?;
        let snap: SnapshotResponse = self.json(response).await?;

        tracing::info!(sandbox_id = %id, provider = %self.name, snapshot_id = %snap.snapshot_id, "Remote snapshot taken");
        Ok(SnapshotRecord {
            id: snap.snapshot_id.clone(),
            sandbox_id: id,
            provider: self.name.clone(),
            label: label.to_string(),
            created_at: Utc::now(),
            restore_token: snap.snapshot_id,
        })
    }

    async fn restore(
        &self,
        id: SandboxId,
        snapshot: &SnapshotRecord,
        credential: Option<&Secret>,
    ) -> Result<()> {
        ensure_snapshot_owner(self, snapshot)?;
        if !self.kind.supports_snapshots() {
            return Err(not_supported(&self.name, Operation::Restore));
        }
        let rid = self.remote_id(id)?;
        let call = Call {
            id: Some(id),
            operation: Operation::Restore,
            path: None,
        };
        let builder = self
            .request(Method::POST, &format!("/sandboxes/{rid}/restore"), credential)?
            .json(&RestoreRequest {
                snapshot_id: &snapshot.restore_token,
            });
        self.send(builder, call, self.request_timeout).await?;
        tracing::info!(sandbox_id = %id, provider = %self.name, snapshot_id = %snapshot.id, "Remote snapshot restored");
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        snapshot: &SnapshotRecord,
        credential: Option<&Secret>,
    ) -> Result<()> {
        ensure_snapshot_owner(self, snapshot)?;
        if !self.kind.supports_snapshots() {
            return Ok(());
        }
        let token = snapshot.restore_token.as_str();
        if token.is_empty() || token.contains(['/', '?', '#', '%']) {
            return Err(CoreError::backend(
                &self.name,
                format!("snapshot {} has an invalid restore token", snapshot.id),
            ));
        }
        let call = Call {
            id: Some(snapshot.sandbox_id),
            operation: Operation::Snapshot,
            path: None,
        };
        let builder = self.request(
            Method::DELETE,
            &format!("/snapshots/{token}"),
            credential,
        )?;
        match self.send(builder, call, self.request_timeout).await {
            Ok(_) | Err(CoreError::InstanceNotFound(_)) | Err(CoreError::NotSupported { .. }) => {
                tracing::debug!(provider = %self.name, snapshot_id = %snapshot.id, "Remote snapshot deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy(&self, id: SandboxId, credential: Option<&Secret>) -> Result<()> {
        let rid = match self.remote_id(id) {
            Ok(rid) => rid,
            Err(e) => {
                let retired = self
                    .retired
                    .lock()
                    .map(|r| r.contains(&id))
                    .unwrap_or(false);
                return if retired { Ok(()) } else { Err(e) };
            }
        };
        let call = Call {
            id: Some(id),
            operation: Operation::Destroy,
            path: None,
        };
        let builder = self.request(Method::DELETE, &format!("/sandboxes/{rid}"), credential)?;
        match self.send(builder, call, self.request_timeout).await {
            Ok(_) | Err(CoreError::InstanceNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if let Ok(mut handles) = self.handles.write() {
            handles.remove(&id);
        }
        if let Ok(mut retired) = self.retired.lock() {
            retired.insert(id);
        }
        tracing::info!(sandbox_id = %id, provider = %self.name, "Remote sandbox destroyed");
        Ok(())
    }

    async fn health_check(&self, credential: Option<&Secret>) -> HealthStatus {
        let builder = match self.request(Method::GET, "/health", credential) {
            Ok(b) => b,
            Err(e) => return HealthStatus::Unavailable(e.to_string()),
        };
        match builder.send().await {
            Err(e) => HealthStatus::Unavailable(format!("{} unreachable: {e}", self.endpoint)),
            Ok(r) if r.status().is_success() => HealthStatus::Available,
            Ok(r) if r.status().as_u16() == 429 || r.status().is_server_error() => {
                HealthStatus::Degraded(format!("health returned {}", r.status()))
            }
            Ok(r) => HealthStatus::Unavailable(format!("health returned {}", r.status())),
        }
    }
}
