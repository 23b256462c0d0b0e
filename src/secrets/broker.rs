//! Just-in-time secret resolution

use crate::audit::{AuditEvent, AuditLog};
use crate::error::{KilnError, KilnResult};
use crate::secrets::{EngineKey, ProviderRegistry, Redactor, Secret, SecretRef};
use std::time::Duration;
use tracing::{debug, warn};

/// A resolved secret together with its keyed digest
#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub reference: SecretRef,
    pub secret: Secret,
    /// HMAC of the plaintext; the only form that enters a fingerprint
    pub digest: String,
}

/// Resolves secret references through the provider registry
///
/// Every resolved value is registered with the shared [`Redactor`] before it
/// is handed out, so captured output produced afterwards is scrubbed.
pub struct SecretBroker {
    registry: ProviderRegistry,
    key: EngineKey,
    timeout: Duration,
    redactor: Redactor,
    audit: AuditLog,
}

impl SecretBroker {
    pub fn new(registry: ProviderRegistry, key: EngineKey, timeout: Duration, audit: AuditLog) -> Self {
        Self {
            registry,
            key,
            timeout,
            redactor: Redactor::new(),
            audit,
        }
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Resolve one reference, bounded by the provider timeout
    ///
    /// Every failure, including a timeout or an unknown scheme, is reported
    /// as `SecretResolution` naming the reference.
    pub async fn resolve(&self, reference: &SecretRef) -> KilnResult<ResolvedSecret> {
        let provider = self.registry.get(reference.scheme()).ok_or_else(|| {
            KilnError::secret(
                reference.to_string(),
                KilnError::UnknownSecretScheme(reference.scheme().to_string()).to_string(),
            )
        })?;

        debug!("Resolving secret {}", reference);
        let secret = match tokio::time::timeout(self.timeout, provider.resolve(reference.locator())).await {
            Ok(Ok(secret)) => secret,
            Ok(Err(KilnError::SecretResolution { reason, .. })) | Ok(Err(KilnError::User(reason))) => {
                warn!("Secret {} could not be resolved: {}", reference, reason);
                return Err(KilnError::secret(reference.to_string(), reason));
            }
            Ok(Err(e)) => {
                warn!("Secret {} could not be resolved: {}", reference, e);
                return Err(KilnError::secret(reference.to_string(), e.to_string()));
            }
            Err(_) => {
                warn!("Secret provider for {} timed out", reference);
                return Err(KilnError::secret(
                    reference.to_string(),
                    format!("provider timed out after {}s", self.timeout.as_secs_f32()),
                ));
            }
        };

        self.redactor.add(&secret);
        let digest = self.digest(&secret)?;

        self.audit
            .record(AuditEvent::SecretResolved {
                scheme: reference.scheme().to_string(),
                digest: digest[..12].to_string(),
            })
            .await;

        Ok(ResolvedSecret {
            reference: reference.clone(),
            secret,
            digest,
        })
    }

    /// Keyed digest of a plaintext value
    pub fn digest(&self, secret: &Secret) -> KilnResult<String> {
        self.key.digest(secret.expose().as_bytes())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::secrets::SecretProvider;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// In-memory provider under the `test` scheme
    pub(crate) struct StaticProvider(pub HashMap<String, String>);

    #[async_trait]
    impl SecretProvider for StaticProvider {
        fn scheme(&self) -> &'static str {
            "test"
        }

        async fn resolve(&self, locator: &str) -> KilnResult<Secret> {
            self.0
                .get(locator)
                .map(|v| Secret::new(v.clone()))
                .ok_or_else(|| KilnError::User(format!("{} not found", locator)))
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl SecretProvider for SlowProvider {
        fn scheme(&self) -> &'static str {
            "slow"
        }

        async fn resolve(&self, _locator: &str) -> KilnResult<Secret> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Secret::new("late"))
        }
    }

    pub(crate) fn static_broker(values: &[(&str, &str)]) -> SecretBroker {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StaticProvider(
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )));
        registry.register(Arc::new(SlowProvider));
        SecretBroker::new(
            registry,
            EngineKey::generate(),
            Duration::from_secs(2),
            AuditLog::disabled(),
        )
    }

    #[tokio::test]
    async fn resolves_and_registers_for_redaction() {
        let broker = static_broker(&[("db", "pa55word")]);
        let resolved = broker
            .resolve(&"test://db".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(resolved.secret.expose(), "pa55word");
        assert_eq!(resolved.digest.len(), 64);
        assert!(!resolved.digest.contains("pa55word"));
        assert_eq!(broker.redactor().scrub_str("pw=pa55word"), "pw=***");
    }

    #[tokio::test]
    async fn unknown_scheme_is_resolution_error() {
        let broker = static_broker(&[]);
        let err = broker
            .resolve(&"nope://x".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::SecretResolution { .. }));
        assert!(err.to_string().contains("nope://x"));
    }

    #[tokio::test]
    async fn missing_value_is_resolution_error() {
        let broker = static_broker(&[]);
        assert!(matches!(
            broker.resolve(&"test://absent".parse().unwrap()).await,
            Err(KilnError::SecretResolution { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_timeout() {
        let broker = static_broker(&[]);
        let err = broker
            .resolve(&"slow://anything".parse().unwrap())
            .await
            .unwrap_err();
        match err {
            KilnError::SecretResolution { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn audit_trail_has_digest_prefix_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StaticProvider(HashMap::from([(
            "db".to_string(),
            "pa55word".to_string(),
        )]))));
        let audit = AuditLog::at(dir.path().join("audit.log"));
        let broker = SecretBroker::new(
            registry,
            EngineKey::generate(),
            Duration::from_secs(2),
            audit.clone(),
        );

        let resolved = broker.resolve(&"test://db".parse().unwrap()).await.unwrap();

        let raw = std::fs::read_to_string(audit.path().unwrap()).unwrap();
        assert!(!raw.contains("pa55word"));
        assert!(!raw.contains(&resolved.digest));
        let recent = audit.recent(1).await;
        assert_eq!(
            recent[0].event,
            AuditEvent::SecretResolved {
                scheme: "test".to_string(),
                digest: resolved.digest[..12].to_string(),
            }
        );
    }

    #[tokio::test]
    async fn digest_changes_with_value() {
        let broker = static_broker(&[("a", "one"), ("b", "two")]);
        let a = broker.resolve(&"test://a".parse().unwrap()).await.unwrap();
        let b = broker.resolve(&"test://b".parse().unwrap()).await.unwrap();
        assert_ne!(a.digest, b.digest);
    }
}
