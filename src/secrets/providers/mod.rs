//! Built-in secret providers

pub mod cloud;
pub mod local;
pub mod vault;

pub use cloud::{AwsSecretsManagerProvider, AzureKeyVaultProvider, GcpSecretManagerProvider};
pub use local::{CommandProvider, EnvProvider, FileProvider};
pub use vault::VaultProvider;

use crate::error::{KilnError, KilnResult};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Run a CLI and return its stdout
///
/// Stdin is closed so an interactive login prompt fails instead of hanging.
pub(crate) async fn run_cli(program: &str, args: &[&str], hint: &str) -> KilnResult<String> {
    debug!("Executing: {} {:?}", program, args);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KilnError::CliNotFound {
                    name: program.to_string(),
                    hint: hint.to_string(),
                }
            } else {
                KilnError::command_failed(program, e)
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(KilnError::command_exec(program, stderr.trim()));
    }

    String::from_utf8(output.stdout)
        .map_err(|_| KilnError::command_exec(program, "output is not valid UTF-8"))
}
