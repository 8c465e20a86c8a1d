//! Tool parameter and response types for MCP tools.
//!
//! Parameters derive `JsonSchema` so tool input schemas are generated from
//! the same structs serde reads.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// Sandbox Lifecycle
// ============================================================================

/// Parameters for creating a new sandbox.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct CreateSandboxParams {
    /// Provider name (default: the configured default provider).
    #[serde(default)]
    pub provider: Option<String>,

    /// Working directory inside the sandbox (default: /workspace).
    #[serde(default)]
    pub working_dir: Option<String>,

    /// CPU cores (default: 1).
    #[serde(default)]
    pub cpu: Option<f32>,

    /// Memory in MiB (default: 512).
    #[serde(default)]
    pub memory_mib: Option<u32>,

    /// Default command timeout in seconds (default: 300).
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Backend template or image.
    #[serde(default)]
    pub template: Option<String>,

    /// Environment variables for every command.
    #[serde(default)]
    pub env: Option<std::collections::BTreeMap<String, String>>,
}

/// A sandbox as reported to clients.
#[derive(Debug, Serialize, JsonSchema)]
pub struct SandboxInfo {
    /// Unique identifier for the sandbox.
    pub sandbox_id: String,
    /// Provider that owns the sandbox.
    pub provider: String,
    /// Current lifecycle state.
    pub state: String,
    /// When the sandbox was created (RFC 3339).
    pub created_at: String,
    /// Last activity (RFC 3339).
    pub last_activity: String,
}

/// Parameters naming a single sandbox.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SandboxIdParams {
    /// ID of the sandbox.
    pub sandbox_id: String,
}

/// Result of destroying a sandbox.
#[derive(Debug, Serialize, JsonSchema)]
pub struct DestroySandboxResult {
    /// Whether the operation succeeded.
    pub success: bool,
}

/// Result of listing sandboxes.
#[derive(Debug, Serialize, JsonSchema)]
pub struct ListSandboxesResult {
    /// Tracked sandboxes, oldest first.
    pub sandboxes: Vec<SandboxInfo>,
}

/// Result of a state query.
#[derive(Debug, Serialize, JsonSchema)]
pub struct SandboxStateResult {
    /// ID of the sandbox.
    pub sandbox_id: String,
    /// Current lifecycle state.
    pub state: String,
}

// ============================================================================
// Command Execution
// ============================================================================

/// Parameters for running a shell command.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCommandParams {
    /// ID of the sandbox to execute in.
    pub sandbox_id: String,

    /// Shell command to execute.
    pub command: String,

    /// Timeout in seconds (default: the sandbox's limit).
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Directory to run in, relative to the sandbox working directory.
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Extra environment variables for this command only.
    #[serde(default)]
    pub env: Option<std::collections::BTreeMap<String, String>>,
}

/// Result of command execution.
#[derive(Debug, Serialize, JsonSchema)]
pub struct ExecResponse {
    /// Exit code of the command (0 = success).
    pub exit_code: i32,

    /// Standard output.
    pub stdout: String,

    /// Standard error.
    pub stderr: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// One entry of a command history.
#[derive(Debug, Serialize, JsonSchema)]
pub struct CommandHistoryEntry {
    /// Per-sandbox sequence number.
    pub seq: u64,
    /// Command text.
    pub command: String,
    /// When the command started (RFC 3339).
    pub started_at: String,
    /// When the command finished (RFC 3339).
    pub finished_at: String,
    /// Exit code, if the command ran.
    pub exit_code: Option<i32>,
    /// Error kind, if the call failed.
    pub error: Option<String>,
}

/// Result of a history query.
#[derive(Debug, Serialize, JsonSchema)]
pub struct CommandHistoryResult {
    /// Commands in execution order.
    pub commands: Vec<CommandHistoryEntry>,
}

// ============================================================================
// File Operations
// ============================================================================

/// Parameters for listing a directory.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListFilesParams {
    /// ID of the sandbox.
    pub sandbox_id: String,

    /// Directory path; "/" is the working directory (default: "/").
    #[serde(default)]
    pub path: Option<String>,
}

/// Information about a file or directory entry.
#[derive(Debug, Serialize, JsonSchema)]
pub struct FileEntryResponse {
    /// Path relative to the working directory.
    pub path: String,

    /// Whether this is a directory.
    pub is_dir: bool,

    /// File size in bytes (0 for directories).
    pub size: u64,
}

/// Result of listing a directory.
#[derive(Debug, Serialize, JsonSchema)]
pub struct ListFilesResult {
    /// Entries in the directory.
    pub entries: Vec<FileEntryResponse>,
}

/// Parameters for uploading a file.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct UploadFileParams {
    /// ID of the sandbox.
    pub sandbox_id: String,

    /// Destination path.
    pub path: String,

    /// File content.
    pub content: String,

    /// Content encoding: "utf8" (default) or "base64".
    #[serde(default)]
    pub encoding: Option<String>,
}

/// Result of uploading a file.
#[derive(Debug, Serialize, JsonSchema)]
pub struct UploadFileResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Bytes written.
    pub bytes: usize,
}

/// Parameters for downloading a file.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DownloadFileParams {
    /// ID of the sandbox.
    pub sandbox_id: String,

    /// File path.
    pub path: String,
}

/// Result of downloading a file.
#[derive(Debug, Serialize, JsonSchema)]
pub struct DownloadFileResult {
    /// File content.
    pub content: String,
    /// "utf8", or "base64" for binary content.
    pub encoding: String,
    /// Size in bytes.
    pub bytes: usize,
}

// ============================================================================
// Snapshots
// ============================================================================

/// Parameters for taking a snapshot.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateSnapshotParams {
    /// ID of the sandbox.
    pub sandbox_id: String,

    /// Label for the snapshot (default: empty).
    #[serde(default)]
    pub label: Option<String>,
}

/// Parameters for restoring a snapshot.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RestoreSnapshotParams {
    /// Sandbox to restore into.
    pub sandbox_id: String,

    /// Snapshot to restore.
    pub snapshot_id: String,

    /// Sandbox the snapshot was taken from (default: `sandbox_id`).
    #[serde(default)]
    pub source_sandbox_id: Option<String>,
}

/// A snapshot as reported to clients.
#[derive(Debug, Serialize, JsonSchema)]
pub struct SnapshotInfo {
    /// Snapshot identifier.
    pub snapshot_id: String,
    /// Sandbox the snapshot was taken from.
    pub sandbox_id: String,
    /// Provider that produced it.
    pub provider: String,
    /// Label.
    pub label: String,
    /// When it was taken (RFC 3339).
    pub created_at: String,
}

/// Result of listing snapshots.
#[derive(Debug, Serialize, JsonSchema)]
pub struct ListSnapshotsResult {
    /// Snapshots, oldest first.
    pub snapshots: Vec<SnapshotInfo>,
}

/// Result of restoring a snapshot.
#[derive(Debug, Serialize, JsonSchema)]
pub struct RestoreSnapshotResult {
    /// Whether the operation succeeded.
    pub success: bool,
}

// ============================================================================
// Providers
// ============================================================================

/// Parameters for the health tool.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ProviderHealthParams {
    /// Probe providers now instead of returning cached health.
    #[serde(default)]
    pub refresh: bool,
}

/// Health of one provider.
#[derive(Debug, Serialize, JsonSchema)]
pub struct ProviderHealthEntry {
    /// Provider name.
    pub provider: String,
    /// "available", "degraded" or "unavailable".
    pub status: String,
    /// Reason, when not available.
    pub reason: Option<String>,
}

/// Result of the health tool.
#[derive(Debug, Serialize, JsonSchema)]
pub struct ProviderHealthResult {
    /// Every configured provider.
    pub providers: Vec<ProviderHealthEntry>,
}
