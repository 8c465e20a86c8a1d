//! # cairn-core
//!
//! Provider-agnostic sandbox management for cairn.
//!
//! One API creates, drives and destroys isolated execution environments on
//! any configured backend: a local process sandbox or a remote sandbox
//! service (E2B, Daytona, Morph, Modal).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │               SandboxService (blocking API)              │
//! └──────────────────────────────────────────────────────────┘
//!            │                                 │
//!            ▼                                 ▼
//! ┌─────────────────────┐           ┌─────────────────────┐
//! │  LifecycleManager   │──────────▶│  CredentialVault    │
//! │  - state machine    │           │  (AES-256-GCM)      │
//! │  - history          │           └─────────────────────┘
//! │  - retries          │                      │
//! └─────────────────────┘                      ▼
//!            │ per-sandbox lanes    ┌─────────────────────┐
//!            ▼                      │  Store              │
//! ┌─────────────────────┐           │  (memory / files)   │
//! │  Bridge             │           └─────────────────────┘
//! │  (private runtime,  │
//! │   bounded queue)    │      ┌──────────── Reaper (idle policy)
//! └─────────────────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐     ┌───────────────┐ ┌───────────────┐
//! │  ProviderRegistry   │────▶│ LocalProvider │ │RemoteProvider │
//! │  (health cache)     │     │ (processes)   │ │ (REST)        │
//! └─────────────────────┘     └───────────────┘ └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use cairn_core::{CairnConfig, SandboxConfig, SandboxService};
//!
//! let service = SandboxService::new(CairnConfig::from_env())?;
//!
//! let config = SandboxConfig::builder()
//!     .provider("local")
//!     .working_dir("/tmp/ws")
//!     .build()?;
//! let sandbox = service.create(config)?;
//!
//! let result = service.execute(sandbox.id, "echo hi", None)?;
//! println!("Output: {}", result.stdout);
//!
//! service.upload_file(sandbox.id, "a.txt", "data")?;
//! for file in service.list_files(sandbox.id, "/")? {
//!     println!("{} ({} bytes)", file.path, file.size);
//! }
//!
//! service.destroy(sandbox.id)?;
//! service.shutdown();
//! ```
//!
//! ## Features
//!
//! - **Lifecycle**: Requested → Ready → Running ⇄ Idle → Stopping → Destroyed,
//!   with Failed for backends that lose an instance
//! - **Ordering**: operations on one sandbox never overlap
//! - **Backpressure**: bounded queue, `Overloaded` instead of unbounded waits
//! - **History**: every transition and command is persisted
//! - **Credentials**: encrypted at rest, redacted in logs
//! - **Idle reaping**: quiet sandboxes are idled and eventually destroyed

mod bridge;
mod config;
mod error;
mod facade;
mod lifecycle;
mod provider;
mod reaper;
mod registry;
mod sandbox;
mod store;
mod types;
mod vault;

pub use bridge::{Bridge, BridgeConfig, BridgeStats, CancelHandle, Pending};
pub use config::{
    CairnConfig, MasterSecretSource, ProviderSettings, ResourceLimits, RetryPolicy, SandboxConfig,
    SandboxConfigBuilder,
};
pub use error::{CoreError, Result};
pub use facade::SandboxService;
pub use lifecycle::{
    CommandOutcome, CommandRecord, HistoryEvent, HistoryRecord, LifecycleManager, ManagerSettings,
    SweepReport,
};
pub use provider::{
    build_provider, LocalProvider, LocalSettings, Provider, RemoteProvider, MAX_OUTPUT_SIZE,
};
pub use reaper::{Reaper, ReaperStats};
pub use registry::ProviderRegistry;
pub use sandbox::{Operation, ResourceUsage, SandboxId, SandboxInstance, SandboxState};
pub use store::{FileStore, MemoryStore, Store};
pub use types::{
    CommandSpec, ExecutionResult, FileInfo, HealthStatus, ProviderKind, SnapshotRecord,
};
pub use vault::{mask, CredentialEntry, CredentialVault, Secret, DEFAULT_KDF_ITERATIONS};
