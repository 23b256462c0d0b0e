//! Scrubbing resolved plaintext out of captured output

use crate::secrets::Secret;
use std::sync::{Arc, RwLock};

pub const REDACTED: &str = "***";

/// Replaces every known secret value with `***`
///
/// Cheap to clone; clones share the same set of values.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    values: Arc<RwLock<Vec<Vec<u8>>>>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, secret: &Secret) {
        let value = secret.expose().as_bytes().to_vec();
        if value.is_empty() {
            return;
        }
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        if !values.contains(&value) {
            values.push(value);
            // Longest first so a secret containing another is scrubbed whole
            values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values
            .read()
            .map(|v| v.is_empty())
            .unwrap_or(false)
    }

    pub fn scrub(&self, input: &[u8]) -> Vec<u8> {
        let values = self.values.read().unwrap_or_else(|p| p.into_inner());
        let mut output = input.to_vec();
        for value in values.iter() {
            output = replace_all(&output, value, REDACTED.as_bytes());
        }
        output
    }

    pub fn scrub_str(&self, input: &str) -> String {
        String::from_utf8_lossy(&self.scrub(input.as_bytes())).into_owned()
    }
}

fn replace_all(haystack: &[u8], needle: &[u8], with: &[u8]) -> Vec<u8> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(with);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_every_occurrence() {
        let redactor = Redactor::new();
        redactor.add(&Secret::new("s3cr3t"));
        assert_eq!(
            redactor.scrub_str("token=s3cr3t; again s3cr3t"),
            "token=***; again ***"
        );
    }

    #[test]
    fn overlapping_values_scrub_longest_first() {
        let redactor = Redactor::new();
        redactor.add(&Secret::new("abc"));
        redactor.add(&Secret::new("abcdef"));
        assert_eq!(redactor.scrub_str("xabcdefx abc"), "x***x ***");
    }

    #[test]
    fn clones_share_values() {
        let redactor = Redactor::new();
        let clone = redactor.clone();
        assert!(clone.is_empty());
        redactor.add(&Secret::new("pw"));
        assert_eq!(clone.scrub_str("pw"), "***");
    }

    #[test]
    fn empty_secret_is_ignored() {
        let redactor = Redactor::new();
        redactor.add(&Secret::new(""));
        assert_eq!(redactor.scrub_str("unchanged"), "unchanged");
    }
}
