//! CairnServer - MCP server that exposes sandbox operations as tools.
//!
//! ServerHandler is implemented by hand so every tool maps onto exactly one
//! [`SandboxService`] call. The service API is blocking, so each call runs on
//! tokio's blocking pool and never stalls the transport.

use crate::config::{MAX_COMMAND_LENGTH, MAX_INPUT_SIZE_BYTES};
use crate::types::*;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cairn_core::{
    CommandOutcome, CommandSpec, CoreError, HealthStatus, HistoryEvent, Operation, SandboxConfig,
    SandboxId, SandboxInstance, SandboxService, SnapshotRecord,
};
use rmcp::{
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData,
};
use schemars::schema_for;
use std::sync::Arc;
use std::time::Duration;

type Args = Option<serde_json::Map<String, serde_json::Value>>;

/// MCP server for cairn sandbox operations.
#[derive(Clone)]
pub struct CairnServer {
    service: Arc<SandboxService>,
}

impl CairnServer {
    /// Wrap a running sandbox service.
    pub fn new(service: Arc<SandboxService>) -> Self {
        Self { service }
    }

    /// Get a cloned Arc to the sandbox service.
    ///
    /// Use this when the service must outlive the server (e.g., for shutdown).
    pub fn service(&self) -> Arc<SandboxService> {
        Arc::clone(&self.service)
    }

    /// Run a service call on the blocking pool.
    ///
    /// Errors are rendered as `kind: message` so clients can branch on the
    /// kind without parsing prose.
    async fn blocking<T, F>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&SandboxService) -> cairn_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = Arc::clone(&self.service);
        match tokio::task::spawn_blocking(move || f(&service)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Self::describe(&e)),
            Err(e) => Err(format!("internal: service call aborted: {e}")),
        }
    }

    fn describe(e: &CoreError) -> String {
        format!("{}: {e}", e.kind())
    }

    /// Parse a sandbox ID from string.
    /// Uses a generic error message to prevent ID enumeration.
    fn parse_sandbox_id(id: &str) -> Result<SandboxId, String> {
        id.parse::<SandboxId>()
            .map_err(|_| "Sandbox not found or invalid ID".to_string())
    }

    /// Decode tool arguments into `T`.
    fn parse_args<T: serde::de::DeserializeOwned>(args: Args) -> Result<T, String> {
        match args
            .map(|a| serde_json::from_value(serde_json::Value::Object(a)))
            .transpose()
        {
            Ok(Some(p)) => Ok(p),
            Ok(None) => Err("Missing required parameters".to_string()),
            Err(e) => Err(format!("Invalid parameters: {e}")),
        }
    }

    /// Truncate sensitive content for logging.
    fn truncate_for_log(s: &str, max_len: usize) -> String {
        if s.len() <= max_len {
            return s.to_string();
        }
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... ({} bytes total)", &s[..end], s.len())
    }

    /// Validate input size.
    fn validate_size(len: usize, max_bytes: usize, field_name: &str) -> Result<(), String> {
        if len > max_bytes {
            Err(format!(
                "{field_name} exceeds maximum size ({len} bytes > {max_bytes} bytes)"
            ))
        } else {
            Ok(())
        }
    }

    /// Helper to create success result with JSON content
    fn json_result<T: serde::Serialize>(data: &T) -> CallToolResult {
        match serde_json::to_string_pretty(data) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => CallToolResult::error(vec![Content::text(format!(
                "JSON serialization error: {e}"
            ))]),
        }
    }

    /// Helper to create error result
    fn error_result(message: impl Into<String>) -> CallToolResult {
        CallToolResult::error(vec![Content::text(message.into())])
    }

    /// Convert schemars RootSchema to rmcp JsonObject
    fn schema_to_json_object<T: schemars::JsonSchema>(
    ) -> Arc<serde_json::Map<String, serde_json::Value>> {
        let schema = schema_for!(T);
        let json = serde_json::to_value(&schema.schema).unwrap_or_else(|_| serde_json::json!({}));
        match json {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        }
    }

    /// Create an empty schema for tools with no parameters
    fn empty_schema() -> Arc<serde_json::Map<String, serde_json::Value>> {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), serde_json::json!("object"));
        map.insert("properties".into(), serde_json::json!({}));
        Arc::new(map)
    }

    fn sandbox_info(instance: &SandboxInstance) -> SandboxInfo {
        SandboxInfo {
            sandbox_id: instance.id.to_string(),
            provider: instance.provider.clone(),
            state: instance.state.to_string(),
            created_at: instance.created_at.to_rfc3339(),
            last_activity: instance.last_activity.to_rfc3339(),
        }
    }

    fn snapshot_info(record: &SnapshotRecord) -> SnapshotInfo {
        SnapshotInfo {
            snapshot_id: record.id.clone(),
            sandbox_id: record.sandbox_id.to_string(),
            provider: record.provider.clone(),
            label: record.label.clone(),
            created_at: record.created_at.to_rfc3339(),
        }
    }

    fn build_sandbox_config(params: CreateSandboxParams) -> Result<SandboxConfig, CoreError> {
        let mut builder = SandboxConfig::builder();
        if let Some(provider) = params.provider {
            builder = builder.provider(provider);
        }
        if let Some(dir) = params.working_dir {
            builder = builder.working_dir(dir);
        }
        if let Some(cpu) = params.cpu {
            builder = builder.cpu(cpu);
        }
        if let Some(memory) = params.memory_mib {
            builder = builder.memory_mib(memory);
        }
        if let Some(secs) = params.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(template) = params.template {
            builder = builder.template(template);
        }
        for (key, value) in params.env.unwrap_or_default() {
            builder = builder.env(key, value);
        }
        builder.build()
    }

    // ========================================================================
    // Tool Implementations
    // ========================================================================

    async fn handle_create_sandbox(&self, args: Args) -> CallToolResult {
        // Every field is optional, so missing arguments mean defaults.
        let params: CreateSandboxParams = match args {
            None => CreateSandboxParams::default(),
            Some(_) => match Self::parse_args(args) {
                Ok(p) => p,
                Err(e) => return Self::error_result(e),
            },
        };

        tracing::info!(provider = ?params.provider, "Creating sandbox");

        let config = match Self::build_sandbox_config(params) {
            Ok(c) => c,
            Err(e) => return Self::error_result(Self::describe(&e)),
        };

        match self.blocking(move |s| s.create(config)).await {
            Ok(instance) => {
                tracing::info!(sandbox_id = %instance.id, provider = %instance.provider, "Created sandbox");
                Self::json_result(&Self::sandbox_info(&instance))
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to create sandbox");
                Self::error_result(format!("Failed to create sandbox: {e}"))
            }
        }
    }

    async fn handle_destroy_sandbox(&self, args: Args) -> CallToolResult {
        let params: SandboxIdParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(_) => return Self::error_result("Missing required parameter: sandbox_id"),
        };
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };

        match self.blocking(move |s| s.destroy(id)).await {
            Ok(()) => {
                tracing::info!(sandbox_id = %id, "Destroyed sandbox");
                Self::json_result(&DestroySandboxResult { success: true })
            }
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "Failed to destroy sandbox");
                Self::error_result(format!("Failed to destroy sandbox: {e}"))
            }
        }
    }

    async fn handle_list_sandboxes(&self) -> CallToolResult {
        tracing::debug!("Listing sandboxes");
        match self.blocking(|s| Ok(s.list_instances())).await {
            Ok(instances) => Self::json_result(&ListSandboxesResult {
                sandboxes: instances.iter().map(Self::sandbox_info).collect(),
            }),
            Err(e) => Self::error_result(e),
        }
    }

    async fn handle_sandbox_state(&self, args: Args) -> CallToolResult {
        let params: SandboxIdParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(_) => return Self::error_result("Missing required parameter: sandbox_id"),
        };
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };

        match self.blocking(move |s| s.get_instance_state(id)).await {
            Ok(state) => Self::json_result(&SandboxStateResult {
                sandbox_id: id.to_string(),
                state: state.to_string(),
            }),
            Err(e) => Self::error_result(e),
        }
    }

    async fn handle_run_command(&self, args: Args) -> CallToolResult {
        let params: RunCommandParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(e) => return Self::error_result(e),
        };
        if let Err(e) = Self::validate_size(params.command.len(), MAX_COMMAND_LENGTH, "command") {
            return Self::error_result(e);
        }
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };

        tracing::info!(
            sandbox_id = %id,
            command = %Self::truncate_for_log(&params.command, 100),
            working_dir = ?params.working_dir,
            "Running command"
        );

        let timeout = params.timeout_secs.map(Duration::from_secs);
        let spec = CommandSpec {
            command: params.command,
            working_dir: params.working_dir,
            env: params.env.unwrap_or_default(),
        };
        match self.blocking(move |s| s.execute(id, spec, timeout)).await {
            Ok(result) => Self::json_result(&ExecResponse {
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
                duration_ms: result.duration.as_millis() as u64,
            }),
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Command failed");
                Self::error_result(format!("Command failed: {e}"))
            }
        }
    }

    async fn handle_list_files(&self, args: Args) -> CallToolResult {
        let params: ListFilesParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(e) => return Self::error_result(e),
        };
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };
        let path = params.path.unwrap_or_else(|| "/".to_string());

        tracing::debug!(sandbox_id = %id, path = %path, "Listing files");

        match self.blocking(move |s| s.list_files(id, &path)).await {
            Ok(files) => Self::json_result(&ListFilesResult {
                entries: files
                    .into_iter()
                    .map(|f| FileEntryResponse {
                        path: f.path,
                        is_dir: f.is_dir,
                        size: f.size,
                    })
                    .collect(),
            }),
            Err(e) => Self::error_result(format!("Failed to list files: {e}")),
        }
    }

    async fn handle_upload_file(&self, args: Args) -> CallToolResult {
        let params: UploadFileParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(e) => return Self::error_result(e),
        };
        if let Err(e) = Self::validate_size(params.content.len(), MAX_INPUT_SIZE_BYTES, "content") {
            return Self::error_result(e);
        }
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };

        let content = match params.encoding.as_deref() {
            None | Some("utf8") | Some("utf-8") => params.content.into_bytes(),
            Some("base64") => match STANDARD.decode(params.content.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => return Self::error_result(format!("Invalid base64 content: {e}")),
            },
            Some(other) => {
                return Self::error_result(format!(
                    "Unknown encoding '{other}', expected utf8 or base64"
                ))
            }
        };

        let bytes = content.len();
        let path = params.path;
        tracing::info!(sandbox_id = %id, path = %path, bytes, "Uploading file");

        match self.blocking(move |s| s.upload_file(id, &path, content)).await {
            Ok(()) => Self::json_result(&UploadFileResult {
                success: true,
                bytes,
            }),
            Err(e) => Self::error_result(format!("Failed to upload file: {e}")),
        }
    }

    async fn handle_download_file(&self, args: Args) -> CallToolResult {
        let params: DownloadFileParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(e) => return Self::error_result(e),
        };
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };

        tracing::debug!(sandbox_id = %id, path = %params.path, "Downloading file");

        let path = params.path;
        match self.blocking(move |s| s.download_file(id, &path)).await {
            Ok(bytes) => {
                let size = bytes.len();
                let (content, encoding) = match String::from_utf8(bytes) {
                    Ok(text) => (text, "utf8"),
                    Err(e) => (STANDARD.encode(e.into_bytes()), "base64"),
                };
                Self::json_result(&DownloadFileResult {
                    content,
                    encoding: encoding.to_string(),
                    bytes: size,
                })
            }
            Err(e) => Self::error_result(format!("Failed to download file: {e}")),
        }
    }

    async fn handle_create_snapshot(&self, args: Args) -> CallToolResult {
        let params: CreateSnapshotParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(e) => return Self::error_result(e),
        };
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };
        let label = params.label.unwrap_or_default();

        match self.blocking(move |s| s.snapshot(id, &label)).await {
            Ok(record) => {
                tracing::info!(sandbox_id = %id, snapshot = %record.id, "Snapshot taken");
                Self::json_result(&Self::snapshot_info(&record))
            }
            Err(e) => Self::error_result(format!("Failed to create snapshot: {e}")),
        }
    }

    async fn handle_restore_snapshot(&self, args: Args) -> CallToolResult {
        let params: RestoreSnapshotParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(e) => return Self::error_result(e),
        };
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };
        let source = match params.source_sandbox_id.as_deref() {
            Some(raw) => match Self::parse_sandbox_id(raw) {
                Ok(source) => source,
                Err(e) => return Self::error_result(e),
            },
            None => id,
        };
        let snapshot_id = params.snapshot_id;

        tracing::info!(sandbox_id = %id, source = %source, snapshot = %snapshot_id, "Restoring snapshot");

        // History keeps snapshot records after the source sandbox is gone.
        let result = self
            .blocking(move |s| {
                let record = s
                    .history(source)?
                    .into_iter()
                    .find_map(|r| match r.event {
                        HistoryEvent::Snapshot {
                            operation: Operation::Snapshot,
                            snapshot,
                        } if snapshot.id == snapshot_id => Some(snapshot),
                        _ => None,
                    });
                match record {
                    Some(record) => s.restore(id, &record).map(|()| true),
                    None => Ok(false),
                }
            })
            .await;

        match result {
            Ok(true) => Self::json_result(&RestoreSnapshotResult { success: true }),
            Ok(false) => Self::error_result(format!("Snapshot not found for sandbox {source}")),
            Err(e) => Self::error_result(format!("Failed to restore snapshot: {e}")),
        }
    }

    async fn handle_list_snapshots(&self, args: Args) -> CallToolResult {
        let params: SandboxIdParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(_) => return Self::error_result("Missing required parameter: sandbox_id"),
        };
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };

        match self.blocking(move |s| s.list_snapshots(id)).await {
            Ok(records) => Self::json_result(&ListSnapshotsResult {
                snapshots: records.iter().map(Self::snapshot_info).collect(),
            }),
            Err(e) => Self::error_result(e),
        }
    }

    async fn handle_command_history(&self, args: Args) -> CallToolResult {
        let params: SandboxIdParams = match Self::parse_args(args) {
            Ok(p) => p,
            Err(_) => return Self::error_result("Missing required parameter: sandbox_id"),
        };
        let id = match Self::parse_sandbox_id(&params.sandbox_id) {
            Ok(id) => id,
            Err(e) => return Self::error_result(e),
        };

        match self.blocking(move |s| s.history(id)).await {
            Ok(records) => {
                let commands = records
                    .into_iter()
                    .filter_map(|r| {
                        let seq = r.seq;
                        let cmd = r.as_command()?.clone();
                        let (exit_code, error) = match cmd.outcome {
                            CommandOutcome::Completed(res) => (Some(res.exit_code), None),
                            CommandOutcome::Failed { kind, .. } => (None, Some(kind)),
                        };
                        Some(CommandHistoryEntry {
                            seq,
                            command: cmd.command,
                            started_at: cmd.started_at.to_rfc3339(),
                            finished_at: cmd.finished_at.to_rfc3339(),
                            exit_code,
                            error,
                        })
                    })
                    .collect();
                Self::json_result(&CommandHistoryResult { commands })
            }
            Err(e) => Self::error_result(e),
        }
    }

    async fn handle_provider_health(&self, args: Args) -> CallToolResult {
        let params: ProviderHealthParams = match args {
            None => ProviderHealthParams::default(),
            Some(_) => match Self::parse_args(args) {
                Ok(p) => p,
                Err(e) => return Self::error_result(e),
            },
        };

        let result = if params.refresh {
            self.blocking(|s| s.refresh_health()).await
        } else {
            self.blocking(|s| Ok(s.list_provider_health())).await
        };

        match result {
            Ok(health) => Self::json_result(&ProviderHealthResult {
                providers: health
                    .into_iter()
                    .map(|(provider, status)| {
                        let (status, reason) = match status {
                            HealthStatus::Available => ("available", None),
                            HealthStatus::Degraded(r) => ("degraded", Some(r)),
                            HealthStatus::Unavailable(r) => ("unavailable", Some(r)),
                        };
                        ProviderHealthEntry {
                            provider,
                            status: status.to_string(),
                            reason,
                        }
                    })
                    .collect(),
            }),
            Err(e) => Self::error_result(e),
        }
    }

    /// Build the list of available tools
    fn build_tools_list() -> Vec<Tool> {
        vec![
            Tool::new(
                "create_sandbox",
                "Create a new isolated sandbox on a provider. Returns the sandbox record.",
                Self::schema_to_json_object::<CreateSandboxParams>(),
            ),
            Tool::new(
                "destroy_sandbox",
                "Destroy a sandbox and release its backend resources.",
                Self::schema_to_json_object::<SandboxIdParams>(),
            ),
            Tool::new(
                "list_sandboxes",
                "List all tracked sandboxes with their state.",
                Self::empty_schema(),
            ),
            Tool::new(
                "sandbox_state",
                "Get the lifecycle state of a sandbox.",
                Self::schema_to_json_object::<SandboxIdParams>(),
            ),
            Tool::new(
                "run_command",
                "Execute a shell command inside a sandbox, optionally in a subdirectory \
                 and with extra environment variables.",
                Self::schema_to_json_object::<RunCommandParams>(),
            ),
            Tool::new(
                "list_files",
                "List a directory in the sandbox. '/' is the working directory.",
                Self::schema_to_json_object::<ListFilesParams>(),
            ),
            Tool::new(
                "upload_file",
                "Write a file into the sandbox (utf8 or base64 content).",
                Self::schema_to_json_object::<UploadFileParams>(),
            ),
            Tool::new(
                "download_file",
                "Read a file from the sandbox. Binary content is returned as base64.",
                Self::schema_to_json_object::<DownloadFileParams>(),
            ),
            Tool::new(
                "create_snapshot",
                "Snapshot the sandbox filesystem, if the provider supports it.",
                Self::schema_to_json_object::<CreateSnapshotParams>(),
            ),
            Tool::new(
                "restore_snapshot",
                "Restore a snapshot into a sandbox on the same provider.",
                Self::schema_to_json_object::<RestoreSnapshotParams>(),
            ),
            Tool::new(
                "list_snapshots",
                "List snapshots taken of a sandbox.",
                Self::schema_to_json_object::<SandboxIdParams>(),
            ),
            Tool::new(
                "command_history",
                "List the commands run in a sandbox, including after it is destroyed.",
                Self::schema_to_json_object::<SandboxIdParams>(),
            ),
            Tool::new(
                "provider_health",
                "Report the health of every configured provider.",
                Self::schema_to_json_object::<ProviderHealthParams>(),
            ),
        ]
    }
}

// ============================================================================
// ServerHandler Implementation
// ============================================================================

impl ServerHandler for CairnServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Cairn MCP Server - Create and drive isolated sandboxes on local or remote \
                 providers. Use create_sandbox to start one, run_command to execute shell \
                 commands, and upload_file, download_file and list_files for files. \
                 Call destroy_sandbox when done."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: Self::build_tools_list(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let result = match request.name.as_ref() {
            "create_sandbox" => self.handle_create_sandbox(request.arguments).await,
            "destroy_sandbox" => self.handle_destroy_sandbox(request.arguments).await,
            "list_sandboxes" => self.handle_list_sandboxes().await,
            "sandbox_state" => self.handle_sandbox_state(request.arguments).await,
            "run_command" => self.handle_run_command(request.arguments).await,
            "list_files" => self.handle_list_files(request.arguments).await,
            "upload_file" => self.handle_upload_file(request.arguments).await,
            "download_file" => self.handle_download_file(request.arguments).await,
            "create_snapshot" => self.handle_create_snapshot(request.arguments).await,
            "restore_snapshot" => self.handle_restore_snapshot(request.arguments).await,
            "list_snapshots" => self.handle_list_snapshots(request.arguments).await,
            "command_history" => self.handle_command_history(request.arguments).await,
            "provider_health" => self.handle_provider_health(request.arguments).await,
            _ => Self::error_result(format!("Unknown tool: {}", request.name)),
        };

        Ok(result)
    }
}
