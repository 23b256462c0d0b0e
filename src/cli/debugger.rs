//! Console front-end for suspended nodes
//!
//! Prints what stopped, optionally drops the user into a shell over the
//! node's filesystem, then asks whether to resume or abort.

use crate::debug::{DebugController, DebugReason, DebugRequest, DebugVerdict};
use crate::error::KilnResult;
use crate::runtime::ContainerRuntime;
use crate::ui::{self, UiContext};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Resume,
    Shell,
    Abort,
}

pub(crate) struct ConsoleDebugger {
    ctx: UiContext,
    runtime: Arc<dyn ContainerRuntime>,
    shell: String,
}

impl ConsoleDebugger {
    pub(crate) fn new(ctx: UiContext, runtime: Arc<dyn ContainerRuntime>, shell: String) -> Self {
        Self {
            ctx,
            runtime,
            shell,
        }
    }

    /// Answer requests until every debug handle is gone; returns how many
    /// nodes were inspected
    pub(crate) fn spawn(self, mut controller: DebugController) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut handled = 0;
            while let Some(request) = controller.next().await {
                let verdict = self.inspect(&request).await;
                request.respond(verdict);
                handled += 1;
            }
            handled
        })
    }

    async fn inspect(&self, request: &DebugRequest) -> DebugVerdict {
        ui::section(
            &self.ctx,
            &ui::suspension_heading(&request.operation, &request.reason),
        );
        if let DebugReason::Failure { error } = &request.reason {
            ui::note(&self.ctx, "error", error);
        }
        ui::key_value(&self.ctx, "filesystem", &request.rootfs.display().to_string());

        loop {
            let choice = ui::select(
                &self.ctx,
                "What next?",
                &[
                    (Choice::Resume, "Resume", "continue the evaluation"),
                    (Choice::Shell, "Shell", "open a shell in the node's filesystem"),
                    (Choice::Abort, "Abort", "fail this node and its dependents"),
                ],
            )
            .await;

            match choice {
                Ok(Choice::Resume) => return DebugVerdict::Resume,
                Ok(Choice::Abort) => return DebugVerdict::Abort,
                Ok(Choice::Shell) => {
                    if let Err(e) = self.shell(request).await {
                        ui::step_error_detail(&self.ctx, "Shell failed", &e.to_string());
                    }
                }
                Err(e) => {
                    warn!("Debug prompt failed: {}", e);
                    return DebugVerdict::Abort;
                }
            }
        }
    }

    async fn shell(&self, request: &DebugRequest) -> KilnResult<()> {
        let attached = request.attach(&*self.runtime, &self.shell, true).await?;
        let code = attached.wait().await?;
        ui::step_info(&self.ctx, &format!("Shell exited with code {}", code));
        Ok(())
    }
}
