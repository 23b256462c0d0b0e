//! Cloud secret managers, read through their CLIs
//!
//! Each provider shells out to the vendor CLI with the user's existing login,
//! so no cloud credentials are handled by kiln itself.

use crate::config::schema::{AwsConfig, GcpConfig};
use crate::error::{KilnError, KilnResult};
use crate::secrets::providers::local::strip_newline;
use crate::secrets::providers::run_cli;
use crate::secrets::{Secret, SecretProvider};
use async_trait::async_trait;
use tracing::debug;

/// `aws-sm://secret-id` via `aws secretsmanager get-secret-value`
pub struct AwsSecretsManagerProvider {
    config: AwsConfig,
}

impl AwsSecretsManagerProvider {
    pub fn new(config: AwsConfig) -> Self {
        Self { config }
    }

    fn args<'a>(&'a self, secret_id: &'a str) -> Vec<&'a str> {
        let mut args = vec![
            "secretsmanager",
            "get-secret-value",
            "--secret-id",
            secret_id,
            "--query",
            "SecretString",
            "--output",
            "text",
        ];
        if let Some(profile) = &self.config.profile {
            args.extend(["--profile", profile.as_str()]);
        }
        if let Some(region) = &self.config.region {
            args.extend(["--region", region.as_str()]);
        }
        args
    }
}

#[async_trait]
impl SecretProvider for AwsSecretsManagerProvider {
    fn scheme(&self) -> &'static str {
        "aws-sm"
    }

    async fn resolve(&self, locator: &str) -> KilnResult<Secret> {
        debug!("Reading AWS secret {}", locator);
        let out = run_cli("aws", &self.args(locator), "Install the AWS CLI: https://aws.amazon.com/cli/").await?;
        Ok(Secret::new(strip_newline(out)))
    }
}

/// `gcp-sm://[project/]secret[/version]` via `gcloud secrets versions access`
pub struct GcpSecretManagerProvider {
    config: GcpConfig,
}

impl GcpSecretManagerProvider {
    pub fn new(config: GcpConfig) -> Self {
        Self { config }
    }

    /// Split a locator into (project, secret, version)
    fn parse<'a>(&'a self, locator: &'a str) -> KilnResult<(&'a str, &'a str, &'a str)> {
        let parts: Vec<&str> = locator.split('/').collect();
        let default_project = || {
            self.config.project.as_deref().ok_or_else(|| {
                KilnError::InvalidSecretRef(format!(
                    "gcp-sm://{} (no project in reference or config)",
                    locator
                ))
            })
        };
        match parts.as_slice() {
            [secret] => Ok((default_project()?, secret, "latest")),
            [project, secret] => Ok((project, secret, "latest")),
            [project, secret, version] => Ok((project, secret, version)),
            _ => Err(KilnError::InvalidSecretRef(format!("gcp-sm://{}", locator))),
        }
    }
}

#[async_trait]
impl SecretProvider for GcpSecretManagerProvider {
    fn scheme(&self) -> &'static str {
        "gcp-sm"
    }

    async fn resolve(&self, locator: &str) -> KilnResult<Secret> {
        let (project, secret, version) = self.parse(locator)?;
        debug!("Reading GCP secret {}/{}", project, secret);
        let secret_arg = format!("--secret={}", secret);
        let project_arg = format!("--project={}", project);
        let out = run_cli(
            "gcloud",
            &["secrets", "versions", "access", version, &secret_arg, &project_arg],
            "Install the Google Cloud SDK: https://cloud.google.com/sdk/docs/install",
        )
        .await?;
        // Secret Manager returns the payload verbatim
        Ok(Secret::new(out))
    }
}

/// `azure-kv://vault-name/secret-name` via `az keyvault secret show`
pub struct AzureKeyVaultProvider;

#[async_trait]
impl SecretProvider for AzureKeyVaultProvider {
    fn scheme(&self) -> &'static str {
        "azure-kv"
    }

    async fn resolve(&self, locator: &str) -> KilnResult<Secret> {
        let (vault, name) = locator
            .split_once('/')
            .filter(|(v, n)| !v.is_empty() && !n.is_empty() && !n.contains('/'))
            .ok_or_else(|| KilnError::InvalidSecretRef(format!("azure-kv://{}", locator)))?;
        debug!("Reading Azure Key Vault secret {}/{}", vault, name);
        let out = run_cli(
            "az",
            &[
                "keyvault", "secret", "show", "--vault-name", vault, "--name", name, "--query",
                "value", "--output", "tsv",
            ],
            "Install the Azure CLI: https://aka.ms/installazurecli",
        )
        .await?;
        Ok(Secret::new(strip_newline(out)))
    }
}
