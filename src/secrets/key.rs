//! Per-engine key for secret digests

use crate::error::{KilnError, KilnResult};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

const KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Random key used to HMAC secret plaintext before it enters a fingerprint
///
/// Stored next to the cache with mode 0600. Losing it invalidates every
/// cache entry that depends on a secret, and nothing else.
#[derive(Clone)]
pub struct EngineKey([u8; KEY_LEN]);

impl EngineKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Load the key at `path`, creating it if missing
    pub async fn load_or_create(path: &Path) -> KilnResult<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
                    KilnError::Internal(format!("engine key at {} is malformed", path.display()))
                })?;
                debug!("Loaded engine key from {}", path.display());
                Ok(Self(key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = Self::generate();
                key.persist(path).await?;
                info!("Generated new engine key at {}", path.display());
                Ok(key)
            }
            Err(e) => Err(KilnError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn persist(&self, path: &Path) -> KilnResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io("creating engine key directory", e))?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(path)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", path.display()), e))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &self.0)
            .await
            .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))
    }

    /// HMAC-SHA256 of `plaintext`, hex encoded
    pub fn digest(&self, plaintext: &[u8]) -> KilnResult<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|e| KilnError::Internal(format!("engine key rejected: {}", e)))?;
        mac.update(plaintext);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn created_once_then_reloaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.key");

        let first = EngineKey::load_or_create(&path).await.unwrap();
        let second = EngineKey::load_or_create(&path).await.unwrap();
        assert_eq!(first.digest(b"x").unwrap(), second.digest(b"x").unwrap());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn digest_is_keyed() {
        let a = EngineKey::generate();
        let b = EngineKey::generate();
        assert_eq!(a.digest(b"hunter2").unwrap(), a.digest(b"hunter2").unwrap());
        assert_ne!(a.digest(b"hunter2").unwrap(), b.digest(b"hunter2").unwrap());
        assert_ne!(a.digest(b"hunter2").unwrap(), a.digest(b"hunter3").unwrap());
        assert!(!a.digest(b"hunter2").unwrap().contains("hunter2"));
    }

    #[test]
    fn debug_hides_key() {
        assert_eq!(format!("{:?}", EngineKey::generate()), "EngineKey(..)");
    }
}
