//! Providers that read the local machine: environment, files, commands

use crate::error::{KilnError, KilnResult};
use crate::secrets::providers::run_cli;
use crate::secrets::{Secret, SecretProvider};
use async_trait::async_trait;
use std::path::Path;

/// `env://NAME`
pub struct EnvProvider;

#[async_trait]
impl SecretProvider for EnvProvider {
    fn scheme(&self) -> &'static str {
        "env"
    }

    async fn resolve(&self, locator: &str) -> KilnResult<Secret> {
        std::env::var(locator)
            .map(Secret::new)
            .map_err(|_| KilnError::User(format!("environment variable {} is not set", locator)))
    }
}

/// `file:///absolute/path`; one trailing newline is dropped
pub struct FileProvider;

#[async_trait]
impl SecretProvider for FileProvider {
    fn scheme(&self) -> &'static str {
        "file"
    }

    async fn resolve(&self, locator: &str) -> KilnResult<Secret> {
        let path = Path::new(locator);
        if !path.is_absolute() {
            return Err(KilnError::PathInvalid {
                path: path.to_path_buf(),
                reason: "secret file paths must be absolute".to_string(),
            });
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
        Ok(Secret::new(strip_newline(content)))
    }
}

/// `cmd://program arg…`: the command's stdout, run without a shell
pub struct CommandProvider;

#[async_trait]
impl SecretProvider for CommandProvider {
    fn scheme(&self) -> &'static str {
        "cmd"
    }

    async fn resolve(&self, locator: &str) -> KilnResult<Secret> {
        let mut parts = locator.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| KilnError::InvalidSecretRef(format!("cmd://{}", locator)))?;
        let args: Vec<&str> = parts.collect();
        let stdout = run_cli(program, &args, "Install it or fix the cmd:// reference").await?;
        Ok(Secret::new(strip_newline(stdout)))
    }
}

pub(crate) fn strip_newline(mut value: String) -> String {
    if value.ends_with('\n') {
        value.pop();
        if value.ends_with('\r') {
            value.pop();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[tokio::test]
    #[serial]
    async fn env_provider_reads_variable() {
        std::env::set_var("KILN_TEST_SECRET", "from-env");
        let secret = EnvProvider.resolve("KILN_TEST_SECRET").await.unwrap();
        assert_eq!(secret.expose(), "from-env");
        std::env::remove_var("KILN_TEST_SECRET");
        assert!(EnvProvider.resolve("KILN_TEST_SECRET").await.is_err());
    }

    #[tokio::test]
    async fn file_provider_strips_one_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "abc\n\n").unwrap();
        let secret = FileProvider
            .resolve(path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(secret.expose(), "abc\n");
    }

    #[tokio::test]
    async fn file_provider_requires_absolute_path() {
        assert!(FileProvider.resolve("relative/token").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_provider_uses_stdout() {
        let secret = CommandProvider.resolve("echo hello").await.unwrap();
        assert_eq!(secret.expose(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_provider_missing_program() {
        let err = CommandProvider
            .resolve("kiln-definitely-not-installed")
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::CliNotFound { .. }));
    }
}
