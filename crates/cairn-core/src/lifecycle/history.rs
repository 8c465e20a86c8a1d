//! Append-only history records for sandbox instances.

use crate::error::CoreError;
use crate::sandbox::{Operation, SandboxId, SandboxState};
use crate::types::{ExecutionResult, SnapshotRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in a sandbox's history.
///
/// `seq` increases strictly per sandbox, so records can be ordered even when
/// timestamps collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Sandbox the record belongs to.
    pub sandbox_id: SandboxId,
    /// Per-sandbox sequence number.
    pub seq: u64,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
    /// What happened.
    pub event: HistoryEvent,
}

/// Event payload of a history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// State machine transition. `operation` is `None` for timer-driven
    /// transitions.
    Lifecycle {
        from: SandboxState,
        to: SandboxState,
        operation: Option<Operation>,
    },
    /// A command invocation, successful or not.
    Command(CommandRecord),
    /// File upload or download.
    File {
        operation: Operation,
        path: String,
        bytes: u64,
    },
    /// Snapshot taken or restored.
    Snapshot {
        operation: Operation,
        snapshot: SnapshotRecord,
    },
}

/// A single command invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Command text as submitted.
    pub command: String,
    /// When the provider call started.
    pub started_at: DateTime<Utc>,
    /// When the provider call returned.
    pub finished_at: DateTime<Utc>,
    /// Result or failure.
    pub outcome: CommandOutcome,
}

/// How a command invocation ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Backend ran the command (exit code may be non-zero).
    Completed(ExecutionResult),
    /// The call failed before a result was produced.
    Failed {
        /// Error kind, see [`CoreError::kind`].
        kind: String,
        /// Error message.
        message: String,
    },
}

impl CommandOutcome {
    pub(crate) fn from_result(result: &Result<ExecutionResult, CoreError>) -> Self {
        match result {
            Ok(res) => Self::Completed(res.clone()),
            Err(e) => Self::Failed {
                kind: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }
}

impl HistoryRecord {
    /// Command record, if this entry is one.
    pub fn as_command(&self) -> Option<&CommandRecord> {
        match &self.event {
            HistoryEvent::Command(cmd) => Some(cmd),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_command_record_serialization() {
        let now = Utc::now();
        let record = HistoryRecord {
            sandbox_id: SandboxId::new(),
            seq: 3,
            recorded_at: now,
            event: HistoryEvent::Command(CommandRecord {
                command: "echo hi".into(),
                started_at: now,
                finished_at: now,
                outcome: CommandOutcome::Completed(ExecutionResult::new(
                    0,
                    "hi\n".into(),
                    String::new(),
                    Duration::from_millis(5),
                )),
            }),
        };

        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["event"]["type"], "command");
        assert_eq!(json["event"]["outcome"]["status"], "completed");
        assert_eq!(json["event"]["outcome"]["stdout"], "hi\n");

        let back: HistoryRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, record);
        assert!(back.as_command().is_some());
    }

    #[test]
    fn test_failed_outcome_keeps_kind() {
        let id = SandboxId::new();
        let outcome = CommandOutcome::from_result(&Err(CoreError::InstanceNotFound(id)));
        match outcome {
            CommandOutcome::Failed { kind, message } => {
                assert_eq!(kind, "instance_not_found");
                assert!(message.contains(&id.to_string()));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
