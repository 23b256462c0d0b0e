//! Error types for Kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in Kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Runtime environment errors
    #[error("Podman not found. Install it from https://podman.io or your package manager")]
    PodmanNotFound,

    #[error("Unsupported platform: {0}. Kiln supports Linux.")]
    UnsupportedPlatform(String),

    #[error("Podman rootless setup incomplete: {reason}")]
    PodmanRootlessSetup { reason: String },

    #[error("Required CLI not found: {name}. {hint}")]
    CliNotFound { name: String, hint: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Graph submission errors
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    // Execution errors
    #[error("{kind} exited with code {exit_code}\n{output}")]
    Execution {
        kind: &'static str,
        exit_code: i32,
        output: String,
    },

    #[error("Sandbox failed: {0}")]
    Sandbox(String),

    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Dependency {operation} failed")]
    DependencyFailed { operation: String },

    #[error("Evaluation cancelled")]
    Cancelled,

    // Service errors
    #[error("Service {hostname} unhealthy after {attempts} health check attempts")]
    ServiceUnhealthy { hostname: String, attempts: u32 },

    #[error("Service {hostname} failed to start: {reason}")]
    ServiceStart { hostname: String, reason: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Port exposure failed for {hostname}:{port}: {reason}")]
    PortExposure {
        hostname: String,
        port: u16,
        reason: String,
    },

    // Secret errors
    #[error("Secret resolution failed for {reference}: {reason}")]
    SecretResolution { reference: String, reason: String },

    #[error("Unknown secret provider scheme: {0}")]
    UnknownSecretScheme(String),

    #[error("Invalid secret reference: {0}")]
    InvalidSecretRef(String),

    // Store and cache errors
    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Stored content {address} failed integrity check (found {actual})")]
    StoreCorruption { address: String, actual: String },

    #[error("Cache entry {fingerprint} is corrupt: {reason}")]
    CacheCorruption { fingerprint: String, reason: String },

    #[error("Invalid content address: {0}")]
    InvalidAddress(String),

    #[error("Invalid tree path: {0}")]
    InvalidTreePath(String),

    // Session and debug errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is closed: {0}")]
    SessionClosed(String),

    #[error("Evaluation aborted from debug session at {operation}")]
    DebugAborted { operation: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Invalid path: {path}: {reason}")]
    PathInvalid { path: PathBuf, reason: String },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a secret resolution error
    pub fn secret(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SecretResolution {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable by the graph author
    ///
    /// Nothing is retried automatically except health probing; this only
    /// classifies errors for callers that want to retry themselves.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SecretResolution { .. }
                | Self::ServiceStart { .. }
                | Self::Sandbox(_)
                | Self::ImagePull { .. }
                | Self::CacheCorruption { .. }
        )
    }

    /// Whether the error was produced by the graph itself rather than the engine
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::PodmanNotFound => Some("Install Podman: https://podman.io/docs/installation"),
            Self::PodmanRootlessSetup { .. } => Some("Run: podman system migrate"),
            Self::Cycle { .. } => {
                Some("Only service bindings may form cycles; break the dependency chain")
            }
            Self::UnknownSecretScheme(_) => {
                Some("Supported schemes: env, file, cmd, vault, aws-sm, gcp-sm, azure-kv")
            }
            Self::StoreCorruption { .. } => Some("Run: kiln cache verify"),
            _ => None,
        }
    }
}

/// Max number of captured output lines carried by execution errors
const OUTPUT_TAIL_LINES: usize = 50;

/// Keep the useful tail of captured output for error diagnostics.
///
/// Combines stdout and stderr, then returns the last `OUTPUT_TAIL_LINES`
/// lines so error messages are actionable without being overwhelming.
pub fn truncate_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > OUTPUT_TAIL_LINES {
        lines[total - OUTPUT_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}
