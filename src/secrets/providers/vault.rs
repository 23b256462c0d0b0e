//! HashiCorp Vault KV v2 provider

use crate::config::schema::VaultConfig;
use crate::error::{KilnError, KilnResult};
use crate::secrets::{Secret, SecretProvider};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// `vault://mount/path#field`
///
/// Reads `GET {address}/v1/{mount}/data/{path}` with the token from the
/// configured environment variable. `#field` may be omitted when the secret
/// has exactly one key.
pub struct VaultProvider {
    config: VaultConfig,
}

#[derive(Debug, PartialEq, Eq)]
struct VaultLocator<'a> {
    mount: &'a str,
    path: &'a str,
    field: Option<&'a str>,
}

#[derive(Deserialize)]
struct KvResponse {
    data: KvData,
}

#[derive(Deserialize)]
struct KvData {
    data: BTreeMap<String, serde_json::Value>,
}

impl VaultProvider {
    pub fn new(config: VaultConfig) -> Self {
        Self { config }
    }

    fn address(&self) -> KilnResult<String> {
        self.config
            .address
            .clone()
            .or_else(|| std::env::var("VAULT_ADDR").ok())
            .map(|a| a.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                KilnError::User("Vault address not set (secrets.vault.address or VAULT_ADDR)".into())
            })
    }

    fn token(&self) -> KilnResult<String> {
        std::env::var(&self.config.token_env).map_err(|_| {
            KilnError::User(format!(
                "Vault token not found in ${}",
                self.config.token_env
            ))
        })
    }
}

fn parse_locator(locator: &str) -> KilnResult<VaultLocator<'_>> {
    let (location, field) = match locator.split_once('#') {
        Some((location, field)) if !field.is_empty() => (location, Some(field)),
        Some(_) => return Err(KilnError::InvalidSecretRef(format!("vault://{}", locator))),
        None => (locator, None),
    };
    let (mount, path) = location
        .split_once('/')
        .filter(|(m, p)| !m.is_empty() && !p.is_empty())
        .ok_or_else(|| KilnError::InvalidSecretRef(format!("vault://{} (expected mount/path)", locator)))?;
    Ok(VaultLocator { mount, path, field })
}

fn select_field(
    mut data: BTreeMap<String, serde_json::Value>,
    field: Option<&str>,
) -> KilnResult<String> {
    let value = match field {
        Some(field) => data
            .remove(field)
            .ok_or_else(|| KilnError::User(format!("field '{}' not present", field)))?,
        None if data.len() == 1 => data
            .into_values()
            .next()
            .ok_or_else(|| KilnError::User("secret is empty".to_string()))?,
        None => {
            return Err(KilnError::User(format!(
                "secret has {} fields; pick one with #field",
                data.len()
            )))
        }
    };
    match value {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

#[async_trait]
impl SecretProvider for VaultProvider {
    fn scheme(&self) -> &'static str {
        "vault"
    }

    async fn resolve(&self, locator: &str) -> KilnResult<Secret> {
        let parsed = parse_locator(locator)?;
        let url = format!(
            "{}/v1/{}/data/{}",
            self.address()?,
            parsed.mount,
            parsed.path
        );
        let token = self.token()?;
        let namespace = self.config.namespace.clone();
        debug!("Reading Vault secret {}/{}", parsed.mount, parsed.path);

        // ureq is blocking
        let response = tokio::task::spawn_blocking(move || -> KilnResult<KvResponse> {
            let mut request = ureq::get(&url).header("X-Vault-Token", &token);
            if let Some(ns) = &namespace {
                request = request.header("X-Vault-Namespace", ns);
            }
            let mut response = request
                .call()
                .map_err(|e| KilnError::User(format!("Vault request failed: {}", e)))?;
            response
                .body_mut()
                .read_json::<KvResponse>()
                .map_err(|e| KilnError::User(format!("unexpected Vault response: {}", e)))
        })
        .await
        .map_err(|e| KilnError::Internal(format!("Vault task failed: {}", e)))??;

        select_field(response.data.data, parsed.field).map(Secret::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_parsing() {
        assert_eq!(
            parse_locator("secret/app/db#password").unwrap(),
            VaultLocator {
                mount: "secret",
                path: "app/db",
                field: Some("password")
            }
        );
        assert_eq!(parse_locator("kv/token").unwrap().field, None);
        assert!(parse_locator("noslash").is_err());
        assert!(parse_locator("secret/app#").is_err());
    }

    #[test]
    fn field_selection() {
        let mut data = BTreeMap::new();
        data.insert("user".to_string(), serde_json::json!("admin"));
        data.insert("port".to_string(), serde_json::json!(5432));

        assert_eq!(select_field(data.clone(), Some("user")).unwrap(), "admin");
        assert_eq!(select_field(data.clone(), Some("port")).unwrap(), "5432");
        assert!(select_field(data.clone(), None).is_err());
        assert!(select_field(data, Some("missing")).is_err());

        let mut single = BTreeMap::new();
        single.insert("token".to_string(), serde_json::json!("t0k"));
        assert_eq!(select_field(single, None).unwrap(), "t0k");
    }

    #[test]
    fn kv_v2_response_shape() {
        let body = r#"{"data":{"data":{"password":"pw"},"metadata":{"version":3}}}"#;
        let parsed: KvResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.data["password"], "pw");
    }
}
