//! Error types for cairn-core.

use crate::sandbox::{Operation, SandboxId, SandboxState};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cairn-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during sandbox operations.
///
/// Every variant names the sandbox or provider involved. Secret material is
/// never part of an error.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Sandbox or service configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Provider is unknown, disabled or marked unavailable.
    #[error("provider {provider} unavailable: {reason}")]
    ProviderUnavailable {
        /// Provider name
        provider: String,
        /// Why the provider cannot serve requests
        reason: String,
    },

    /// Credential is missing or could not be decrypted.
    #[error("credential unavailable for provider {provider}")]
    CredentialUnavailable {
        /// Provider name
        provider: String,
    },

    /// Backend refused because a quota or limit was reached.
    #[error("quota exceeded on provider {provider}: {detail}")]
    QuotaExceeded {
        /// Provider name
        provider: String,
        /// Limit that was hit
        detail: String,
    },

    /// Sandbox not found
    #[error("sandbox not found: {0}")]
    InstanceNotFound(SandboxId),

    /// Backend reports the sandbox exists but is not running.
    #[error("sandbox {0} is not running")]
    InstanceNotRunning(SandboxId),

    /// Operation is not allowed in the current lifecycle state.
    #[error("sandbox {id}: cannot {operation} while {state}")]
    InvalidStateTransition {
        /// Sandbox ID
        id: SandboxId,
        /// State at the time of the request
        state: SandboxState,
        /// Rejected operation
        operation: Operation,
    },

    /// Operation did not complete before its deadline.
    #[error("{operation} on {target} timed out after {after:?}")]
    Timeout {
        /// Sandbox ID or provider name
        target: String,
        /// Operation that timed out
        operation: Operation,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Bridge queue is full.
    #[error("{operation} on {target} rejected: bridge overloaded ({queued} queued)")]
    Overloaded {
        /// Sandbox ID or provider name
        target: String,
        /// Rejected operation
        operation: Operation,
        /// Queue depth at rejection time
        queued: usize,
    },

    /// Caller aborted the operation.
    #[error("{operation} on {target} cancelled")]
    Cancelled {
        /// Sandbox ID or provider name
        target: String,
        /// Cancelled operation
        operation: Operation,
    },

    /// Backend call failed.
    #[error("backend failure on provider {provider}: {detail}")]
    BackendFailure {
        /// Provider name
        provider: String,
        /// Failure detail from the backend
        detail: String,
        /// Whether retrying may succeed
        retryable: bool,
    },

    /// Provider does not implement the operation.
    #[error("provider {provider} does not support {operation}")]
    NotSupported {
        /// Provider name
        provider: String,
        /// Unsupported operation
        operation: Operation,
    },

    /// Snapshot was taken on a different provider.
    #[error("snapshot {snapshot} from provider {snapshot_provider} cannot be restored on provider {target_provider}")]
    IncompatibleSnapshot {
        /// Snapshot identifier
        snapshot: String,
        /// Provider that created the snapshot
        snapshot_provider: String,
        /// Provider of the target sandbox
        target_provider: String,
    },

    /// Path does not exist in the sandbox.
    #[error("sandbox {id}: path not found: {path}")]
    PathNotFound {
        /// Sandbox ID
        id: SandboxId,
        /// Requested path
        path: String,
    },

    /// Backend denied access to the path.
    #[error("sandbox {id}: permission denied: {path}")]
    PermissionDenied {
        /// Sandbox ID
        id: SandboxId,
        /// Requested path
        path: String,
    },

    /// Path is malformed or escapes the sandbox.
    #[error("sandbox {id}: invalid path: {path}")]
    PathInvalid {
        /// Sandbox ID
        id: SandboxId,
        /// Requested path
        path: String,
    },

    /// Persistence collaborator failed.
    #[error("store error: {0}")]
    Store(String),
}

impl CoreError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::CredentialUnavailable { .. } => "credential_unavailable",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::InstanceNotFound(_) => "instance_not_found",
            Self::InstanceNotRunning(_) => "instance_not_running",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::Timeout { .. } => "timeout",
            Self::Overloaded { .. } => "overloaded",
            Self::Cancelled { .. } => "cancelled",
            Self::BackendFailure { .. } => "backend_failure",
            Self::NotSupported { .. } => "not_supported",
            Self::IncompatibleSnapshot { .. } => "incompatible_snapshot",
            Self::PathNotFound { .. } => "path_not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::PathInvalid { .. } => "path_invalid",
            Self::Store(_) => "store",
        }
    }

    /// Transient backend failure worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendFailure { retryable: true, .. })
    }

    /// The backend lost the instance; the sandbox cannot recover.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::InstanceNotFound(_) | Self::InstanceNotRunning(_))
    }

    /// Errors that degrade the whole provider rather than one sandbox.
    pub fn degrades_provider(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. } | Self::CredentialUnavailable { .. }
        )
    }

    pub(crate) fn backend(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::BackendFailure {
            provider: provider.into(),
            detail: detail.into(),
            retryable: false,
        }
    }

    pub(crate) fn transient(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::BackendFailure {
            provider: provider.into(),
            detail: detail.into(),
            retryable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_names_id_state_and_operation() {
        let id = SandboxId::new();
        let err = CoreError::InvalidStateTransition {
            id,
            state: SandboxState::Stopping,
            operation: Operation::Execute,
        };
        let msg = err.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("Stopping"));
        assert!(msg.contains("execute"));
        assert_eq!(err.kind(), "invalid_state_transition");
    }

    #[test]
    fn retryable_only_for_transient_backend_failures() {
        assert!(CoreError::transient("e2b", "503").is_retryable());
        assert!(!CoreError::backend("e2b", "bad request").is_retryable());
        assert!(!CoreError::Store("disk full".into()).is_retryable());
    }

    #[test]
    fn unrecoverable_classification() {
        let id = SandboxId::new();
        assert!(CoreError::InstanceNotFound(id).is_unrecoverable());
        assert!(CoreError::InstanceNotRunning(id).is_unrecoverable());
        assert!(!CoreError::transient("local", "io").is_unrecoverable());
    }

    #[test]
    fn credential_error_does_not_leak_secret() {
        let err = CoreError::CredentialUnavailable {
            provider: "e2b".into(),
        };
        assert_eq!(err.to_string(), "credential unavailable for provider e2b");
        assert!(err.degrades_provider());
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CoreError>();
    }
}
