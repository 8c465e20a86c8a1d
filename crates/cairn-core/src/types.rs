//! Value types produced by provider operations.

use crate::sandbox::SandboxId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Backend families cairn knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Subprocesses and directories on the host.
    Local,
    /// E2B cloud sandboxes.
    E2b,
    /// Daytona development environments.
    Daytona,
    /// Morph cloud instances.
    Morph,
    /// Modal sandboxes.
    Modal,
}

impl ProviderKind {
    /// All known kinds.
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Local,
        ProviderKind::E2b,
        ProviderKind::Daytona,
        ProviderKind::Morph,
        ProviderKind::Modal,
    ];

    /// Canonical lowercase name, also used as the provider name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::E2b => "e2b",
            Self::Daytona => "daytona",
            Self::Morph => "morph",
            Self::Modal => "modal",
        }
    }

    /// Whether the backend can capture and restore sandbox state.
    pub fn supports_snapshots(&self) -> bool {
        matches!(self, Self::Local | Self::Morph)
    }

    /// Whether calls need a credential from the vault.
    pub fn requires_credential(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "e2b" => Ok(Self::E2b),
            "daytona" => Ok(Self::Daytona),
            "morph" => Ok(Self::Morph),
            "modal" => Ok(Self::Modal),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Result from command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Process exit code (-1 if the process couldn't be started).
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Wall-clock time spent in the backend.
    pub duration: Duration,
    /// Whether the command exited with code 0.
    pub success: bool,
}

impl ExecutionResult {
    /// Build a result, deriving `success` from the exit code.
    pub fn new(exit_code: i32, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            duration,
            success: exit_code == 0,
        }
    }
}

/// A command to run in a sandbox, with optional per-call overrides.
///
/// `working_dir` is relative to the sandbox working directory and `env` is
/// merged over the sandbox environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Shell command line.
    pub command: String,
    /// Directory to run in, inside the sandbox.
    pub working_dir: Option<String>,
    /// Extra environment variables for this command only.
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// A command with no overrides.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Run in `dir` instead of the sandbox working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set one environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl From<&str> for CommandSpec {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for CommandSpec {
    fn from(command: String) -> Self {
        Self::new(command)
    }
}

impl From<&String> for CommandSpec {
    fn from(command: &String) -> Self {
        Self::new(command.as_str())
    }
}

/// File entry from a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path relative to the sandbox working directory.
    pub path: String,
    /// File size in bytes (0 for directories).
    pub size: u64,
    /// True if this is a directory.
    pub is_dir: bool,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// Point-in-time capture of a sandbox.
///
/// The restore token is opaque and only meaningful to the provider that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Snapshot identifier.
    pub id: String,
    /// Sandbox the snapshot was taken from.
    pub sandbox_id: SandboxId,
    /// Provider that created the snapshot.
    pub provider: String,
    /// Caller-supplied label.
    pub label: String,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// Backend-specific restore handle.
    pub restore_token: String,
}

/// Provider health as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum HealthStatus {
    /// Provider is serving requests.
    Available,
    /// Provider works with reduced capability or performance.
    Degraded(String),
    /// Provider cannot serve requests.
    Unavailable(String),
}

impl HealthStatus {
    /// Whether new work may be routed to the provider.
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unavailable(reason) => write!(f, "unavailable: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_result_success() {
        let result = ExecutionResult::new(0, "hello".into(), String::new(), Duration::ZERO);
        assert!(result.success);
        let result = ExecutionResult::new(2, String::new(), "error".into(), Duration::ZERO);
        assert!(!result.success);
    }

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("ls").working_dir("src").env("A", "1");
        assert_eq!(spec.command, "ls");
        assert_eq!(spec.working_dir.as_deref(), Some("src"));
        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(CommandSpec::from("pwd"), CommandSpec::new("pwd"));
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("E2B".parse::<ProviderKind>(), Ok(ProviderKind::E2b));
        assert_eq!(" local ".parse::<ProviderKind>(), Ok(ProviderKind::Local));
        assert!("docker-swarm".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_snapshot_capability() {
        assert!(ProviderKind::Local.supports_snapshots());
        assert!(ProviderKind::Morph.supports_snapshots());
        assert!(!ProviderKind::E2b.supports_snapshots());
        assert!(!ProviderKind::Daytona.supports_snapshots());
        assert!(!ProviderKind::Modal.supports_snapshots());
    }

    #[test]
    fn test_health_status_serialization() {
        let json = serde_json::to_value(HealthStatus::Unavailable("no credential".into()))
            .expect("serialize");
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["reason"], "no credential");
        assert!(!HealthStatus::Unavailable(String::new()).is_usable());
        assert!(HealthStatus::Degraded("slow".into()).is_usable());
    }
}
