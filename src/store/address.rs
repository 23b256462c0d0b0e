//! Content addresses
//!
//! A `ContentAddress` is the SHA-256 digest of a blob's bytes. Trees are
//! blobs too (their canonical manifest), so a tree address is a Merkle root.

use crate::error::KilnError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const PREFIX: &str = "sha256:";

/// Digest identifying an immutable blob or tree
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress([u8; 32]);

impl ContentAddress {
    /// Address of the given bytes
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex digest without the algorithm prefix
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for logs and tables
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX, self.hex())
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentAddress({})", self.short())
    }
}

impl FromStr for ContentAddress {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s.strip_prefix(PREFIX).unwrap_or(s);
        let bytes = hex::decode(hex_part).map_err(|_| KilnError::InvalidAddress(s.to_string()))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KilnError::InvalidAddress(s.to_string()))?;
        Ok(Self(digest))
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_same_address() {
        assert_eq!(ContentAddress::of(b"hello"), ContentAddress::of(b"hello"));
        assert_ne!(ContentAddress::of(b"hello"), ContentAddress::of(b"hello!"));
    }

    #[test]
    fn display_and_parse() {
        let addr = ContentAddress::of(b"");
        let text = addr.to_string();
        assert_eq!(
            text,
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(text.parse::<ContentAddress>().unwrap(), addr);
        assert_eq!(addr.hex().parse::<ContentAddress>().unwrap(), addr);
        assert_eq!(addr.short(), "e3b0c44298fc");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("sha256:xyz".parse::<ContentAddress>().is_err());
        assert!("sha256:abcd".parse::<ContentAddress>().is_err());
    }

    #[test]
    fn serde_as_string() {
        let addr = ContentAddress::of(b"x");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr));
        let back: ContentAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
