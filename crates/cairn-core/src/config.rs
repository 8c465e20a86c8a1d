//! Sandbox and service configuration types.

use crate::error::CoreError;
use crate::types::ProviderKind;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Resource limits applied to a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// CPU cores (fractional allowed).
    pub cpu: f32,
    /// Memory in MiB.
    pub memory_mib: u32,
    /// Default per-command timeout.
    pub timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory_mib: 512,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Configuration for creating a sandbox.
///
/// Immutable once a sandbox has been created from it.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Provider name; `None` selects the service default.
    pub provider: Option<String>,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Working directory inside the sandbox (absolute).
    pub working_dir: String,
    /// Template or image identifier, provider specific.
    pub template: Option<String>,
    /// Environment variables applied to every command.
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: None,
            limits: ResourceLimits::default(),
            working_dir: "/workspace".into(),
            template: None,
            env: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(provider) = &self.provider {
            if provider.trim().is_empty() {
                return Err(CoreError::InvalidConfig("provider must not be empty".into()));
            }
        }
        if !self.working_dir.starts_with('/') {
            return Err(CoreError::InvalidConfig(format!(
                "working_dir must be absolute: {}",
                self.working_dir
            )));
        }
        if !(self.limits.cpu > 0.0) {
            return Err(CoreError::InvalidConfig("cpu must be > 0".into()));
        }
        if self.limits.memory_mib == 0 {
            return Err(CoreError::InvalidConfig("memory_mib must be > 0".into()));
        }
        if self.limits.timeout.is_zero() {
            return Err(CoreError::InvalidConfig("timeout must be > 0".into()));
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(CoreError::InvalidConfig(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the provider name.
    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.config.provider = Some(name.into());
        self
    }

    /// Set CPU cores.
    pub fn cpu(mut self, cores: f32) -> Self {
        self.config.limits.cpu = cores;
        self
    }

    /// Set memory in MiB.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.limits.memory_mib = mib;
        self
    }

    /// Set the default command timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.limits.timeout = timeout;
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.working_dir = dir.into();
        self
    }

    /// Set the template or image identifier.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.config.template = Some(template.into());
        self
    }

    /// Add an environment variable. Later values replace earlier ones.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SandboxConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

/// Per-provider settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    /// Backend family.
    pub kind: ProviderKind,
    /// Whether the provider is registered at startup.
    pub enabled: bool,
    /// API endpoint for remote providers.
    pub endpoint: Option<String>,
    /// Default template when a create request names none.
    pub template: Option<String>,
    /// Override of the global retry policy.
    pub retry: Option<RetryPolicy>,
}

impl ProviderSettings {
    /// Enabled settings for `kind` with no endpoint.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            enabled: true,
            endpoint: None,
            template: None,
            retry: None,
        }
    }

    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Where the vault's master secret comes from.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum MasterSecretSource {
    /// No master secret; every credential lookup fails.
    #[default]
    None,
    /// Secret given inline (e.g. from an environment variable).
    Inline(String),
    /// Secret read from a file at startup.
    File(PathBuf),
}

impl std::fmt::Debug for MasterSecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Inline(_) => write!(f, "Inline(<redacted>)"),
            Self::File(path) => write!(f, "File({})", path.display()),
        }
    }
}

impl MasterSecretSource {
    /// Resolve the secret bytes.
    pub fn resolve(&self) -> Result<Option<Vec<u8>>, CoreError> {
        match self {
            Self::None => Ok(None),
            Self::Inline(secret) => Ok(Some(secret.as_bytes().to_vec())),
            Self::File(path) => std::fs::read(path)
                .map(|bytes| {
                    let trimmed = String::from_utf8_lossy(&bytes).trim().as_bytes().to_vec();
                    Some(trimmed)
                })
                .map_err(|e| {
                    CoreError::InvalidConfig(format!(
                        "cannot read master secret file {}: {e}",
                        path.display()
                    ))
                }),
        }
    }
}

/// Configuration for the sandbox service.
#[derive(Debug, Clone)]
pub struct CairnConfig {
    /// Provider used when a create request names none.
    pub default_provider: String,
    /// Provider settings keyed by provider name.
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Root directory for local sandboxes.
    pub local_root: PathBuf,
    /// Max live sandboxes per local provider (0 = unlimited).
    pub local_max_sandboxes: usize,
    /// Max bytes per uploaded file.
    pub max_upload_bytes: u64,
    /// Bridge worker count.
    pub workers: usize,
    /// Max operations waiting for a worker before `Overloaded`.
    pub queue_depth: usize,
    /// Deadline for non-execute operations.
    pub op_timeout: Duration,
    /// Slack added on top of command timeouts for the bridge deadline.
    pub deadline_slack: Duration,
    /// Inactivity before Running becomes Idle.
    pub idle_after: Duration,
    /// Inactivity before a sandbox is evicted.
    pub idle_timeout: Duration,
    /// Interval between idle sweeps.
    pub sweep_interval: Duration,
    /// Global retry policy.
    pub retry: RetryPolicy,
    /// Vault master secret.
    pub master_secret: MasterSecretSource,
    /// PBKDF2 iterations for credential keys.
    pub kdf_iterations: u32,
    /// Directory for persisted history/credentials; in-memory when `None`.
    pub state_dir: Option<PathBuf>,
    /// Credential profile name.
    pub profile: String,
}

impl Default for CairnConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert("local".to_string(), ProviderSettings::new(ProviderKind::Local));
        Self {
            default_provider: "local".into(),
            providers,
            local_root: std::env::temp_dir().join("cairn"),
            local_max_sandboxes: 100,
            max_upload_bytes: 10 * 1024 * 1024,
            workers: 8,
            queue_depth: 64,
            op_timeout: Duration::from_secs(60),
            deadline_slack: Duration::from_secs(2),
            idle_after: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            master_secret: MasterSecretSource::None,
            kdf_iterations: 100_000,
            state_dir: None,
            profile: "default".into(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

impl CairnConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CAIRN_DEFAULT_PROVIDER` | `local` |
    /// | `CAIRN_PROVIDERS` | `local` |
    /// | `CAIRN_<PROVIDER>_ENDPOINT` | none |
    /// | `CAIRN_<PROVIDER>_TEMPLATE` | none |
    /// | `CAIRN_<PROVIDER>_MAX_RETRIES` | global value |
    /// | `CAIRN_LOCAL_ROOT` | `$TMPDIR/cairn` |
    /// | `CAIRN_WORKERS` | `8` |
    /// | `CAIRN_QUEUE_DEPTH` | `64` |
    /// | `CAIRN_OP_TIMEOUT_SECS` | `60` |
    /// | `CAIRN_IDLE_AFTER_SECS` | `300` |
    /// | `CAIRN_IDLE_TIMEOUT_SECS` | `1800` |
    /// | `CAIRN_SWEEP_INTERVAL_SECS` | `30` |
    /// | `CAIRN_MAX_RETRIES` | `3` |
    /// | `CAIRN_RETRY_BASE_MS` | `200` |
    /// | `CAIRN_MASTER_SECRET` / `CAIRN_MASTER_SECRET_FILE` | none |
    /// | `CAIRN_STATE_DIR` | none (in-memory) |
    /// | `CAIRN_PROFILE` | `default` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let retry = RetryPolicy {
            max_retries: env_parse("CAIRN_MAX_RETRIES").unwrap_or(default.retry.max_retries),
            base_delay: env_parse::<u64>("CAIRN_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.retry.base_delay),
        };

        let enabled = std::env::var("CAIRN_PROVIDERS").unwrap_or_else(|_| "local".into());
        let mut providers = BTreeMap::new();
        for name in enabled.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let kind = match name.parse::<ProviderKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "Ignoring unknown provider");
                    continue;
                }
            };
            let prefix = format!("CAIRN_{}", kind.as_str().to_uppercase());
            let settings = ProviderSettings {
                kind,
                enabled: true,
                endpoint: std::env::var(format!("{prefix}_ENDPOINT")).ok(),
                template: std::env::var(format!("{prefix}_TEMPLATE")).ok(),
                retry: env_parse::<u32>(&format!("{prefix}_MAX_RETRIES")).map(|max_retries| {
                    RetryPolicy {
                        max_retries,
                        base_delay: retry.base_delay,
                    }
                }),
            };
            providers.insert(kind.as_str().to_string(), settings);
        }

        let master_secret = if let Ok(secret) = std::env::var("CAIRN_MASTER_SECRET") {
            MasterSecretSource::Inline(secret)
        } else if let Ok(path) = std::env::var("CAIRN_MASTER_SECRET_FILE") {
            MasterSecretSource::File(PathBuf::from(path))
        } else {
            MasterSecretSource::None
        };

        Self {
            default_provider: std::env::var("CAIRN_DEFAULT_PROVIDER")
                .unwrap_or(default.default_provider),
            providers,
            local_root: std::env::var("CAIRN_LOCAL_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.local_root),
            local_max_sandboxes: default.local_max_sandboxes,
            max_upload_bytes: default.max_upload_bytes,
            workers: env_parse("CAIRN_WORKERS").unwrap_or(default.workers),
            queue_depth: env_parse("CAIRN_QUEUE_DEPTH").unwrap_or(default.queue_depth),
            op_timeout: env_secs("CAIRN_OP_TIMEOUT_SECS").unwrap_or(default.op_timeout),
            deadline_slack: default.deadline_slack,
            idle_after: env_secs("CAIRN_IDLE_AFTER_SECS").unwrap_or(default.idle_after),
            idle_timeout: env_secs("CAIRN_IDLE_TIMEOUT_SECS").unwrap_or(default.idle_timeout),
            sweep_interval: env_secs("CAIRN_SWEEP_INTERVAL_SECS")
                .unwrap_or(default.sweep_interval),
            retry,
            master_secret,
            kdf_iterations: default.kdf_iterations,
            state_dir: std::env::var("CAIRN_STATE_DIR").ok().map(PathBuf::from),
            profile: std::env::var("CAIRN_PROFILE").unwrap_or(default.profile),
        }
    }

    /// Retry policy for `provider`.
    pub fn retry_for(&self, provider: &str) -> RetryPolicy {
        self.providers
            .get(provider)
            .and_then(|p| p.retry)
            .unwrap_or(self.retry)
    }

    /// Validate the service configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.workers == 0 {
            return Err(CoreError::InvalidConfig("workers must be > 0".into()));
        }
        if self.op_timeout.is_zero() {
            return Err(CoreError::InvalidConfig("op_timeout must be > 0".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(CoreError::InvalidConfig("sweep_interval must be > 0".into()));
        }
        if self.idle_timeout < self.idle_after {
            return Err(CoreError::InvalidConfig(
                "idle_timeout must not be shorter than idle_after".into(),
            ));
        }
        match self.providers.get(&self.default_provider) {
            Some(p) if p.enabled => {}
            _ => {
                return Err(CoreError::InvalidConfig(format!(
                    "default provider {} is not enabled",
                    self.default_provider
                )))
            }
        }
        for (name, settings) in &self.providers {
            if settings.enabled && settings.kind != ProviderKind::Local && settings.endpoint.is_none()
            {
                return Err(CoreError::InvalidConfig(format!(
                    "provider {name} requires an endpoint"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.limits.memory_mib, 512);
        assert_eq!(config.working_dir, "/workspace");
        assert!(config.provider.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_success() {
        let config = SandboxConfig::builder()
            .provider("local")
            .cpu(2.0)
            .memory_mib(1024)
            .timeout(Duration::from_secs(60))
            .working_dir("/tmp/ws")
            .template("python-3.12")
            .env("FOO", "bar")
            .env("FOO", "baz")
            .build()
            .expect("should build successfully");

        assert_eq!(config.provider.as_deref(), Some("local"));
        assert_eq!(config.limits.memory_mib, 1024);
        assert_eq!(config.limits.timeout, Duration::from_secs(60));
        assert_eq!(config.working_dir, "/tmp/ws");
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.env["FOO"], "baz");
    }

    #[test]
    fn test_builder_rejects_relative_working_dir() {
        let result = SandboxConfig::builder().working_dir("ws").build();
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_rejects_zero_limits() {
        assert!(SandboxConfig::builder().memory_mib(0).build().is_err());
        assert!(SandboxConfig::builder().cpu(0.0).build().is_err());
        assert!(SandboxConfig::builder().timeout(Duration::ZERO).build().is_err());
    }

    #[test]
    fn test_builder_rejects_bad_env_key() {
        assert!(SandboxConfig::builder().env("A=B", "c").build().is_err());
        assert!(SandboxConfig::builder().env("", "c").build().is_err());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_service_config_validation() {
        let config = CairnConfig::default();
        assert!(config.validate().is_ok());

        let mut config = CairnConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = CairnConfig::default();
        config.default_provider = "e2b".into();
        assert!(config.validate().is_err());

        let mut config = CairnConfig::default();
        config
            .providers
            .insert("e2b".into(), ProviderSettings::new(ProviderKind::E2b));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_override_per_provider() {
        let mut config = CairnConfig::default();
        let mut morph = ProviderSettings::new(ProviderKind::Morph).with_endpoint("http://x");
        morph.retry = Some(RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
        });
        config.providers.insert("morph".into(), morph);
        assert_eq!(config.retry_for("morph").max_retries, 1);
        assert_eq!(config.retry_for("local").max_retries, 3);
    }

    #[test]
    fn test_master_secret_debug_is_redacted() {
        let source = MasterSecretSource::Inline("hunter2".into());
        assert!(!format!("{source:?}").contains("hunter2"));
    }
}
