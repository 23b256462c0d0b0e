//! Secret references, providers and the broker
//!
//! Secrets are resolved just in time, when a sandbox is being built. The
//! plaintext goes to the runtime through env inheritance or a 0600 file
//! outside the snapshot, never through argv, the store or the cache. Only a
//! keyed digest ([`EngineKey::digest`]) reaches a fingerprint.

pub mod broker;
pub mod key;
pub mod providers;
pub mod redact;
pub mod reference;

pub use broker::{ResolvedSecret, SecretBroker};
pub use key::EngineKey;
pub use redact::Redactor;
pub use reference::SecretRef;

use crate::config::schema::SecretsConfig;
use crate::error::KilnResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Plaintext secret value
///
/// `Debug` and `Display` never print the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(redact::REDACTED)
    }
}

/// Resolves locators of one scheme to plaintext
#[async_trait]
pub trait SecretProvider: Send + Sync {
    fn scheme(&self) -> &'static str;

    async fn resolve(&self, locator: &str) -> KilnResult<Secret>;
}

/// Providers keyed by scheme
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn SecretProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in provider
    pub fn with_defaults(config: &SecretsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(providers::EnvProvider));
        registry.register(Arc::new(providers::FileProvider));
        registry.register(Arc::new(providers::CommandProvider));
        registry.register(Arc::new(providers::VaultProvider::new(config.vault.clone())));
        registry.register(Arc::new(providers::AwsSecretsManagerProvider::new(
            config.aws.clone(),
        )));
        registry.register(Arc::new(providers::GcpSecretManagerProvider::new(
            config.gcp.clone(),
        )));
        registry.register(Arc::new(providers::AzureKeyVaultProvider));
        registry
    }

    /// Add or replace the provider for its scheme
    pub fn register(&mut self, provider: Arc<dyn SecretProvider>) {
        self.providers.insert(provider.scheme().to_string(), provider);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn SecretProvider>> {
        self.providers.get(scheme).cloned()
    }

    pub fn schemes(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_never_formatted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn default_registry_schemes() {
        let registry = ProviderRegistry::with_defaults(&SecretsConfig::default());
        assert_eq!(
            registry.schemes(),
            vec!["aws-sm", "azure-kv", "cmd", "env", "file", "gcp-sm", "vault"]
        );
        assert!(registry.get("ftp").is_none());
    }
}
