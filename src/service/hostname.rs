use crate::cache::Fingerprint;
use crate::session::SessionId;
use sha2::{Digest, Sha256};

/// Deterministic hostname of a service instance
///
/// Derived only from the instance identity and its owner, so every member
/// of a service group can be told its peers' names before any of them
/// starts. The result is a valid DNS label.
pub fn hostname_for(fingerprint: &Fingerprint, module: &str, session: &SessionId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"kiln.hostname.v1\0");
    hasher.update(fingerprint.as_bytes());
    hasher.update((module.len() as u64).to_be_bytes());
    hasher.update(module.as_bytes());
    hasher.update(session.to_string().as_bytes());
    let digest = hasher.finalize();
    format!("svc-{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FingerprintBuilder;

    fn fp(s: &str) -> Fingerprint {
        FingerprintBuilder::new("service").str("cmd", s).finish()
    }

    #[test]
    fn deterministic() {
        let session = SessionId::new();
        assert_eq!(
            hostname_for(&fp("redis"), "main", &session),
            hostname_for(&fp("redis"), "main", &session)
        );
    }

    #[test]
    fn distinct_per_identity_module_and_session() {
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        let base = hostname_for(&fp("redis"), "main", &s1);
        assert_ne!(base, hostname_for(&fp("postgres"), "main", &s1));
        assert_ne!(base, hostname_for(&fp("redis"), "other", &s1));
        assert_ne!(base, hostname_for(&fp("redis"), "main", &s2));
    }

    #[test]
    fn valid_dns_label() {
        let name = hostname_for(&fp("x"), "main", &SessionId::new());
        assert!(name.len() <= 63);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }
}
