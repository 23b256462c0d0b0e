//! Interactive debugging of failed nodes and breakpoints
//!
//! The executor task that hits a breakpoint (or a failure, when enabled)
//! sends a [`DebugRequest`] to the controller and blocks on its reply. The
//! controller side decides when to resume; nothing continues until it does.
//! No store or cache lock is held while a request is pending.

use crate::audit::{AuditEvent, AuditLog};
use crate::error::{KilnError, KilnResult};
use crate::runtime::{AttachedShell, ContainerRuntime, SecretDelivery, ShellRequest};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Why evaluation stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugReason {
    Breakpoint { label: Option<String> },
    Failure { error: String },
}

impl fmt::Display for DebugReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Breakpoint { label: Some(label) } => write!(f, "breakpoint '{}'", label),
            Self::Breakpoint { label: None } => write!(f, "breakpoint"),
            Self::Failure { error } => write!(f, "failure: {}", error),
        }
    }
}

/// Decision returned by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugVerdict {
    Resume,
    Abort,
}

/// A suspended node waiting for the controller
///
/// `rootfs` is a scratch copy of the node's filesystem that stays in place
/// until the request is answered.
pub struct DebugRequest {
    pub operation: String,
    pub reason: DebugReason,
    pub rootfs: PathBuf,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub secrets: Vec<SecretDelivery>,
    reply: oneshot::Sender<DebugVerdict>,
}

impl DebugRequest {
    /// Shell over the suspended filesystem with the node's environment
    pub fn shell_request(&self, shell: &str, inherit_stdio: bool) -> ShellRequest {
        ShellRequest {
            label: self.operation.clone(),
            rootfs: self.rootfs.clone(),
            env: self.env.clone(),
            workdir: self.workdir.clone(),
            secrets: self.secrets.clone(),
            shell: shell.to_string(),
            inherit_stdio,
        }
    }

    /// Open the interactive byte stream through the runtime
    pub async fn attach(
        &self,
        runtime: &dyn ContainerRuntime,
        shell: &str,
        inherit_stdio: bool,
    ) -> KilnResult<AttachedShell> {
        runtime
            .attach_shell(self.shell_request(shell, inherit_stdio))
            .await
    }

    pub fn respond(self, verdict: DebugVerdict) {
        // The executor may have been cancelled meanwhile
        let _ = self.reply.send(verdict);
    }

    pub fn resume(self) {
        self.respond(DebugVerdict::Resume);
    }

    pub fn abort(self) {
        self.respond(DebugVerdict::Abort);
    }
}

impl fmt::Debug for DebugRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugRequest")
            .field("operation", &self.operation)
            .field("reason", &self.reason)
            .field("rootfs", &self.rootfs)
            .finish()
    }
}

/// What the executor knows about a suspended node
#[derive(Debug, Clone)]
pub struct Suspension {
    pub operation: String,
    pub reason: DebugReason,
    pub rootfs: PathBuf,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub secrets: Vec<SecretDelivery>,
}

/// Executor side of the debug channel
#[derive(Clone)]
pub struct DebugHandle {
    tx: mpsc::Sender<DebugRequest>,
    audit: AuditLog,
}

impl DebugHandle {
    /// Block until the controller answers
    ///
    /// A controller that goes away without answering counts as an abort.
    pub async fn suspend(&self, suspension: Suspension) -> KilnResult<DebugVerdict> {
        let (reply, verdict) = oneshot::channel();
        let operation = suspension.operation.clone();
        let reason = suspension.reason.to_string();

        info!("Suspending {} ({})", operation, reason);
        self.audit
            .record(AuditEvent::DebugAttached {
                operation: operation.clone(),
                reason,
            })
            .await;

        let request = DebugRequest {
            operation: suspension.operation,
            reason: suspension.reason,
            rootfs: suspension.rootfs,
            env: suspension.env,
            workdir: suspension.workdir,
            secrets: suspension.secrets,
            reply,
        };
        if self.tx.send(request).await.is_err() {
            warn!("Debug controller is gone; aborting {}", operation);
            return Ok(DebugVerdict::Abort);
        }

        let verdict = verdict.await.unwrap_or(DebugVerdict::Abort);
        self.audit
            .record(AuditEvent::DebugAnswered {
                operation,
                resumed: verdict == DebugVerdict::Resume,
            })
            .await;
        Ok(verdict)
    }

    /// Turn an abort into the error reported for the node
    pub fn check(verdict: DebugVerdict, operation: &str) -> KilnResult<()> {
        match verdict {
            DebugVerdict::Resume => Ok(()),
            DebugVerdict::Abort => Err(KilnError::DebugAborted {
                operation: operation.to_string(),
            }),
        }
    }
}

impl fmt::Debug for DebugHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Controller side of the debug channel
pub struct DebugController {
    rx: mpsc::Receiver<DebugRequest>,
}

impl DebugController {
    /// Create a connected handle/controller pair
    pub fn channel(audit: AuditLog) -> (DebugHandle, DebugController) {
        let (tx, rx) = mpsc::channel(8);
        (DebugHandle { tx, audit }, DebugController { rx })
    }

    /// Next suspended node, or `None` once every handle is dropped
    pub async fn next(&mut self) -> Option<DebugRequest> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn suspension(rootfs: PathBuf) -> Suspension {
        Suspension {
            operation: "build".into(),
            reason: DebugReason::Breakpoint {
                label: Some("before-tests".into()),
            },
            rootfs,
            env: BTreeMap::new(),
            workdir: None,
            secrets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn executor_waits_for_verdict() {
        let (handle, mut controller) = DebugController::channel(AuditLog::disabled());
        let task = tokio::spawn(async move { handle.suspend(suspension(PathBuf::from("/tmp/x"))).await });

        let request = controller.next().await.unwrap();
        assert_eq!(request.operation, "build");
        assert!(!task.is_finished());
        request.resume();

        assert_eq!(task.await.unwrap().unwrap(), DebugVerdict::Resume);
    }

    #[tokio::test]
    async fn dropped_request_aborts() {
        let (handle, mut controller) = DebugController::channel(AuditLog::disabled());
        let task = tokio::spawn(async move { handle.suspend(suspension(PathBuf::from("/tmp/x"))).await });

        drop(controller.next().await.unwrap());
        assert_eq!(task.await.unwrap().unwrap(), DebugVerdict::Abort);
    }

    #[tokio::test]
    async fn missing_controller_aborts() {
        let (handle, controller) = DebugController::channel(AuditLog::disabled());
        drop(controller);
        let verdict = handle.suspend(suspension(PathBuf::from("/tmp/x"))).await.unwrap();
        assert_eq!(verdict, DebugVerdict::Abort);
        assert!(matches!(
            DebugHandle::check(verdict, "build"),
            Err(KilnError::DebugAborted { .. })
        ));
    }

    #[tokio::test]
    async fn attach_streams_through_runtime() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();

        let (handle, mut controller) = DebugController::channel(AuditLog::disabled());
        let root = dir.path().to_path_buf();
        let task = tokio::spawn(async move { handle.suspend(suspension(root)).await });

        let request = controller.next().await.unwrap();
        let runtime = FakeRuntime::new();
        let mut shell = request.attach(&runtime, "/bin/sh", false).await.unwrap();

        let mut stdin = shell.stdin.take().unwrap();
        let mut stdout = BufReader::new(shell.stdout.take().unwrap()).lines();
        assert_eq!(stdout.next_line().await.unwrap().unwrap(), "debug build");

        stdin.write_all(b"ls marker\n").await.unwrap();
        assert_eq!(stdout.next_line().await.unwrap().unwrap(), "true");
        drop(stdin);
        assert_eq!(shell.wait().await.unwrap(), 0);

        request.abort();
        assert_eq!(task.await.unwrap().unwrap(), DebugVerdict::Abort);
    }
}
