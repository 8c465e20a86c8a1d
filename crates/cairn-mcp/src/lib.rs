//! # cairn-mcp
//!
//! MCP server exposing cairn sandboxes to AI agents.
//!
//! ## Tools
//!
//! | Tool | Description |
//! |------|-------------|
//! | `create_sandbox` | Create a sandbox on a provider |
//! | `destroy_sandbox` | Destroy a sandbox |
//! | `list_sandboxes` | List tracked sandboxes |
//! | `sandbox_state` | Lifecycle state of one sandbox |
//! | `run_command` | Run a shell command |
//! | `list_files` | List a directory |
//! | `upload_file` | Write a file (utf8 or base64) |
//! | `download_file` | Read a file |
//! | `create_snapshot` | Snapshot the filesystem |
//! | `restore_snapshot` | Restore a snapshot |
//! | `list_snapshots` | Snapshots of a sandbox |
//! | `command_history` | Commands run in a sandbox |
//! | `provider_health` | Health of every provider |
//!
//! ## Transports
//!
//! Stdio for local AI tools and streamable HTTP for remote agents, selected
//! with `CAIRN_TRANSPORT` (see [`ServerConfig::from_env`]).

mod config;
pub mod http;
mod server;
mod types;

pub use config::{ServerConfig, TransportMode, MAX_COMMAND_LENGTH, MAX_INPUT_SIZE_BYTES};
pub use server::CairnServer;
