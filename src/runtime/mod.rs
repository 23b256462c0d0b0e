//! Container runtime adapter
//!
//! Runs one fully resolved operation in a sandbox. The engine hands the
//! runtime concrete host paths (a materialised rootfs, mount sources) and
//! already-resolved secrets; the runtime never reads the store, the cache
//! or the host environment on its own.
//!
//! Sandboxes get no implicit access to the host: no host filesystem beyond
//! the explicit mounts, no network unless services are bound, no host env
//! vars and no credentials.

mod factory;
#[cfg(test)]
pub(crate) mod fake;
mod podman;

pub use factory::{create_runtime, Platform};
pub use podman::PodmanRuntime;

use crate::error::KilnResult;
use crate::secrets::Secret;
use crate::service::HealthCheck;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::task::JoinHandle;

/// A host directory or file mounted into the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub source: PathBuf,
    pub target: String,
    pub readonly: bool,
}

/// How a resolved secret reaches the sandbox
///
/// Env values are passed through the runtime process environment, file
/// values through a 0600 file outside the rootfs; neither appears in argv.
#[derive(Debug, Clone)]
pub enum SecretDelivery {
    Env { name: String, value: Secret },
    File { target: String, value: Secret },
}

impl SecretDelivery {
    /// Path inside the sandbox that must stay out of the snapshot
    pub fn file_target(&self) -> Option<&str> {
        match self {
            Self::File { target, .. } => Some(target),
            Self::Env { .. } => None,
        }
    }
}

/// A name resolvable from inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAlias {
    pub alias: String,
    pub hostname: String,
    /// Known once the target is running; members of one service group
    /// reach each other through `hostname` instead
    pub address: Option<IpAddr>,
}

/// Network a sandbox joins when it binds services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network: String,
    pub hosts: Vec<HostAlias>,
}

/// A one-shot command over a materialised rootfs
///
/// The rootfs directory is modified in place; the engine snapshots it after
/// the runtime returns.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Operation id, for container names and logs
    pub label: String,
    pub rootfs: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub mounts: Vec<MountPoint>,
    pub secrets: Vec<SecretDelivery>,
    pub network: Option<NetworkAttachment>,
}

/// Result of a one-shot command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A long-lived service to start
#[derive(Debug, Clone)]
pub struct ServiceLaunch {
    pub label: String,
    /// Assigned before launch; registered as a DNS name on `network`
    pub hostname: String,
    pub rootfs: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub mounts: Vec<MountPoint>,
    pub secrets: Vec<SecretDelivery>,
    pub network: NetworkAttachment,
    /// Ports published to loopback so the engine can probe and expose them
    pub ports: Vec<u16>,
}

/// A running service sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    pub hostname: String,
    pub address: Option<IpAddr>,
}

/// Interactive shell for a debug session
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub label: String,
    pub rootfs: PathBuf,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub secrets: Vec<SecretDelivery>,
    pub shell: String,
    /// Attach to the controlling terminal instead of returning pipes
    pub inherit_stdio: bool,
}

/// Byte streams of an attached shell plus its completion
pub struct AttachedShell {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    done: JoinHandle<KilnResult<i32>>,
}

impl AttachedShell {
    pub fn new(done: JoinHandle<KilnResult<i32>>) -> Self {
        Self {
            stdin: None,
            stdout: None,
            stderr: None,
            done,
        }
    }

    /// Wait for the shell to exit, returning its exit code
    pub async fn wait(self) -> KilnResult<i32> {
        self.done.await.map_err(|e| {
            crate::error::KilnError::Internal(format!("shell task failed: {}", e))
        })?
    }
}

impl fmt::Debug for AttachedShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedShell")
            .field("piped", &self.stdout.is_some())
            .finish()
    }
}

/// Abstract container runtime interface
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check if the runtime is available on this system
    async fn is_available(&self) -> KilnResult<bool>;

    /// Ensure the runtime is ready (rootless setup and so on)
    async fn ensure_ready(&self) -> KilnResult<()>;

    /// Pull an image and unpack its filesystem into `dest`
    async fn pull_image(&self, reference: &str, dest: &Path) -> KilnResult<()>;

    /// Run a command to completion; a non-zero exit is not an error here
    async fn exec(&self, request: ExecRequest) -> KilnResult<ExecOutcome>;

    /// Create a session network (idempotent)
    async fn create_network(&self, name: &str) -> KilnResult<()>;

    /// Remove a session network, ignoring a missing one
    async fn remove_network(&self, name: &str) -> KilnResult<()>;

    /// Start a service sandbox without waiting for it to be healthy
    async fn launch_service(&self, launch: ServiceLaunch) -> KilnResult<SandboxHandle>;

    /// Run one health probe; `Ok(false)` means not healthy yet
    async fn probe(
        &self,
        handle: &SandboxHandle,
        check: &HealthCheck,
        timeout: Duration,
    ) -> KilnResult<bool>;

    /// Stop and remove a service sandbox
    async fn stop_service(&self, handle: &SandboxHandle) -> KilnResult<()>;

    /// Host-reachable address of a service port
    async fn sandbox_address(&self, handle: &SandboxHandle, port: u16) -> KilnResult<SocketAddr>;

    /// Open an interactive shell over a rootfs
    async fn attach_shell(&self, request: ShellRequest) -> KilnResult<AttachedShell>;

    /// Get the human-readable runtime name for display
    fn runtime_name(&self) -> &'static str;
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines for error reporting. This is a standalone
/// async function (not behind `async_trait`) to avoid lifetime issues with the
/// `dyn Fn` callback.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> Vec<String> {
    let mut all_output = Vec::new();
    let (Some(stderr), Some(stdout)) = (child.stderr.take(), child.stdout.take()) else {
        return all_output;
    };

    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_reader = BufReader::new(stdout).lines();

    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    _ => stderr_done = true,
                }
            }
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    _ => stdout_done = true,
                }
            }
        }
    }

    all_output
}
