//! Sandbox identity, lifecycle states and the instance record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a sandbox.
///
/// Identifiers are random and never reused. Destroyed ids are remembered in
/// a [`RetiredIds`] set so that a repeated destroy succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Operations that can be requested against a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Execute,
    ListFiles,
    UploadFile,
    DownloadFile,
    Snapshot,
    Restore,
    Destroy,
    Cancel,
    HealthCheck,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Execute => "execute",
            Self::ListFiles => "list_files",
            Self::UploadFile => "upload_file",
            Self::DownloadFile => "download_file",
            Self::Snapshot => "snapshot",
            Self::Restore => "restore",
            Self::Destroy => "destroy",
            Self::Cancel => "cancel",
            Self::HealthCheck => "health_check",
        };
        f.write_str(name)
    }
}

/// Current lifecycle state of a sandbox.
///
/// ```text
/// Requested → Ready → Running ⇄ Idle → Stopping → Destroyed
///      └────────┴────────┴────────┴──────→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Create has been accepted, backend has not confirmed yet.
    Requested,
    /// Backend confirmed creation, no command has run yet.
    Ready,
    /// At least one command ran and the sandbox saw recent activity.
    Running,
    /// No activity for the configured idle interval.
    Idle,
    /// Destroy is in flight.
    Stopping,
    /// Backend handle released; the identifier is retired.
    Destroyed,
    /// Unrecoverable provider error.
    Failed,
}

impl SandboxState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }

    /// Whether the sandbox has a live backend and accepts work.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Idle)
    }

    /// Whether `op` may be requested while in this state.
    pub fn permits(&self, op: Operation) -> bool {
        match op {
            Operation::Create | Operation::HealthCheck => false,
            Operation::Destroy => !matches!(self, Self::Destroyed),
            Operation::Cancel => !self.is_terminal(),
            Operation::Execute
            | Operation::ListFiles
            | Operation::UploadFile
            | Operation::DownloadFile
            | Operation::Snapshot
            | Operation::Restore => self.is_live(),
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (Destroyed, _) | (Failed, Stopping) => false,
            (Failed, Destroyed) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Requested, Ready) => true,
            (Ready, Running) => true,
            (Running, Idle) | (Idle, Running) => true,
            (Requested | Ready | Running | Idle, Stopping) => true,
            (Stopping, Destroyed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "Requested"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::Idle => write!(f, "Idle"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Destroyed => write!(f, "Destroyed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// How many destroyed ids a [`RetiredIds`] set remembers.
pub(crate) const RETIRED_CAPACITY: usize = 16 * 1024;

/// Ids of destroyed sandboxes, oldest evicted first.
///
/// Bounded so a long-running process does not grow without limit. An id
/// that has been evicted is simply unknown again: destroying it reports
/// `InstanceNotFound`, which callers releasing a backend treat as done.
#[derive(Debug)]
pub(crate) struct RetiredIds {
    order: VecDeque<SandboxId>,
    ids: HashSet<SandboxId>,
    capacity: usize,
}

impl RetiredIds {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn insert(&mut self, id: SandboxId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    pub(crate) fn contains(&self, id: &SandboxId) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

impl Default for RetiredIds {
    fn default() -> Self {
        Self::with_capacity(RETIRED_CAPACITY)
    }
}

/// Resource usage reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU utilisation in percent, if the backend reports it.
    pub cpu_percent: Option<f32>,
    /// Resident memory in MiB.
    pub memory_mib: Option<u64>,
    /// Bytes stored in the sandbox filesystem.
    pub disk_bytes: Option<u64>,
}

/// A sandbox as tracked by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInstance {
    /// Unique identifier.
    pub id: SandboxId,
    /// Name of the provider that owns the backend handle.
    pub provider: String,
    /// Current lifecycle state.
    pub state: SandboxState,
    /// When the create request was accepted.
    pub created_at: DateTime<Utc>,
    /// Last successful operation against the backend.
    pub last_activity: DateTime<Utc>,
    /// Latest resource usage snapshot.
    pub usage: ResourceUsage,
}

impl SandboxInstance {
    /// A freshly requested instance with no backend yet.
    pub fn requested(id: SandboxId, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            provider: provider.into(),
            state: SandboxState::Requested,
            created_at: now,
            last_activity: now,
            usage: ResourceUsage::default(),
        }
    }
}
