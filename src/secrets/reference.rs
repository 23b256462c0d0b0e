//! Secret references (`scheme://locator`)

use crate::error::KilnError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Pointer to a secret held by an external provider
///
/// A reference never carries plaintext, so it is safe to log, hash into a
/// fingerprint and store in graph documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretRef {
    scheme: String,
    locator: String,
}

impl SecretRef {
    pub fn new(scheme: &str, locator: &str) -> Result<Self, KilnError> {
        format!("{}://{}", scheme, locator).parse()
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }
}

impl FromStr for SecretRef {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, locator) = s
            .split_once("://")
            .ok_or_else(|| KilnError::InvalidSecretRef(format!("{} (expected scheme://locator)", s)))?;

        let scheme_ok = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !scheme_ok {
            return Err(KilnError::InvalidSecretRef(format!("{} (bad scheme)", s)));
        }
        if locator.is_empty() {
            return Err(KilnError::InvalidSecretRef(format!("{} (empty locator)", s)));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            locator: locator.to_string(),
        })
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.locator)
    }
}

impl Serialize for SecretRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SecretRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
