//! Configuration schema for Kiln
//!
//! Global configuration is stored at `~/.config/kiln/config.toml`; a project
//! may override any key with a `.kiln.toml` file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Graph executor settings
    pub engine: EngineConfig,

    /// Content store settings
    pub store: StoreConfig,

    /// Operation cache settings
    pub cache: CacheConfig,

    /// Service lifecycle settings
    pub services: ServicesConfig,

    /// Secret provider settings
    pub secrets: SecretsConfig,

    /// Container runtime settings
    pub runtime: RuntimeConfig,

    /// Debug controller settings
    pub debug: DebugConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Graph executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Module name used when a graph does not declare one
    pub default_module: String,

    /// Maximum number of sandboxes executing at once
    pub max_parallel: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_module: "main".to_string(),
            max_parallel: 8,
        }
    }
}

/// Content store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store root (defaults to `<state dir>/store`)
    pub path: Option<PathBuf>,
}

/// Operation cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the operation cache (default: true)
    pub enabled: bool,

    /// Cache root (defaults to `<state dir>/cache`)
    pub path: Option<PathBuf>,

    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,

    /// Maximum total size of cached results in MB before LRU eviction
    pub max_total_mb: u64,

    /// Auto-remove entries older than N days (0 = disabled)
    pub gc_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_entries: 10_000,
            max_total_mb: 10 * 1024,
            gc_days: 30,
        }
    }
}

/// Service lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Delay between the last reference release and teardown
    pub grace_period_secs: u64,

    /// Health probe attempts before a service is marked failed
    pub health_max_attempts: u32,

    /// Initial delay between health probes
    pub health_interval_ms: u64,

    /// Upper bound for the exponential probe backoff
    pub health_max_interval_ms: u64,

    /// Timeout applied to a single probe
    pub health_timeout_ms: u64,
}

impl ServicesConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
            health_max_attempts: 10,
            health_interval_ms: 250,
            health_max_interval_ms: 4_000,
            health_timeout_ms: 2_000,
        }
    }
}

/// Secret provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Timeout for a single provider call
    pub timeout_secs: u64,

    /// HashiCorp Vault settings
    pub vault: VaultConfig,

    /// AWS Secrets Manager settings
    pub aws: AwsConfig,

    /// GCP Secret Manager settings
    pub gcp: GcpConfig,
}

impl SecretsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            vault: VaultConfig::default(),
            aws: AwsConfig::default(),
            gcp: GcpConfig::default(),
        }
    }
}

/// HashiCorp Vault settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault address (falls back to `VAULT_ADDR`)
    pub address: Option<String>,

    /// Environment variable holding the Vault token
    pub token_env: String,

    /// Vault Enterprise namespace
    pub namespace: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: None,
            token_env: "VAULT_TOKEN".to_string(),
            namespace: None,
        }
    }
}

/// AWS Secrets Manager settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// AWS profile to use
    pub profile: Option<String>,

    /// AWS region
    pub region: Option<String>,
}

/// GCP Secret Manager settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    /// Default GCP project ID
    pub project: Option<String>,
}

/// Container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Podman binary to invoke
    pub podman: String,

    /// Prefix for per-session networks and container names
    pub name_prefix: String,

    /// Linux capabilities to drop in every sandbox
    pub cap_drop: Vec<String>,

    /// Security options applied to every sandbox
    pub security_opt: Vec<String>,

    /// PID limit (0 = no limit)
    pub pids_limit: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            podman: "podman".to_string(),
            name_prefix: "kiln".to_string(),
            cap_drop: vec!["ALL".to_string()],
            security_opt: vec!["no-new-privileges".to_string()],
            pids_limit: 4096,
        }
    }
}

/// Debug controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Open an interactive session when a node fails
    pub on_failure: bool,

    /// Shell started inside debug sandboxes
    pub shell: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            on_failure: true,
            shell: "/bin/sh".to_string(),
        }
    }
}
