//! Operation fingerprints
//!
//! A fingerprint hashes an operation's kind, the content addresses of its
//! resolved inputs and its parameters. Every field is length-prefixed and
//! named, so no two distinct field sequences can collide by concatenation.

use crate::error::KilnError;
use crate::store::ContentAddress;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Bumped whenever the fingerprint encoding changes, invalidating old entries
const FORMAT_VERSION: &str = "kiln.fingerprint.v1";

/// Deterministic identity of an operation's inputs and parameters
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| KilnError::InvalidAddress(s.to_string()))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KilnError::InvalidAddress(s.to_string()))?;
        Ok(Self(digest))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental fingerprint construction
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    /// Start a fingerprint for an operation kind
    pub fn new(kind: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.write("format", FORMAT_VERSION.as_bytes());
        builder.write("kind", kind.as_bytes());
        builder
    }

    fn write(&mut self, name: &str, value: &[u8]) {
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
    }

    pub fn str(mut self, name: &str, value: &str) -> Self {
        self.write(name, value.as_bytes());
        self
    }

    pub fn bytes(mut self, name: &str, value: &[u8]) -> Self {
        self.write(name, value);
        self
    }

    pub fn address(mut self, name: &str, value: &ContentAddress) -> Self {
        self.write(name, value.as_bytes());
        self
    }

    pub fn fingerprint(mut self, name: &str, value: &Fingerprint) -> Self {
        self.write(name, value.as_bytes());
        self
    }

    /// Hash a serializable parameter block
    ///
    /// Callers must use ordered maps so the JSON encoding is canonical.
    pub fn json<T: Serialize>(mut self, name: &str, value: &T) -> Result<Self, KilnError> {
        let encoded = serde_json::to_vec(value)?;
        self.write(name, &encoded);
        Ok(self)
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn deterministic() {
        let a = FingerprintBuilder::new("exec").str("cmd", "make").finish();
        let b = FingerprintBuilder::new("exec").str("cmd", "make").finish();
        assert_eq!(a, b);
    }

    #[test]
    fn kind_and_fields_matter() {
        let base = FingerprintBuilder::new("exec").str("cmd", "make").finish();
        assert_ne!(base, FingerprintBuilder::new("image").str("cmd", "make").finish());
        assert_ne!(base, FingerprintBuilder::new("exec").str("cmd", "make test").finish());
        assert_ne!(base, FingerprintBuilder::new("exec").str("cwd", "make").finish());
    }

    #[test]
    fn length_prefix_prevents_concatenation_collisions() {
        let a = FingerprintBuilder::new("k").str("a", "bc").str("d", "").finish();
        let b = FingerprintBuilder::new("k").str("a", "b").str("cd", "").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn json_params_are_order_independent_with_btreemap() {
        let mut one = BTreeMap::new();
        one.insert("B", "2");
        one.insert("A", "1");
        let mut two = BTreeMap::new();
        two.insert("A", "1");
        two.insert("B", "2");

        let a = FingerprintBuilder::new("exec").json("env", &one).unwrap().finish();
        let b = FingerprintBuilder::new("exec").json("env", &two).unwrap().finish();
        assert_eq!(a, b);
    }

    #[test]
    fn display_parse_roundtrip() {
        let fp = FingerprintBuilder::new("exec").finish();
        assert_eq!(fp.to_string().parse::<Fingerprint>().unwrap(), fp);
        assert_eq!(fp.short().len(), 12);
    }
}
