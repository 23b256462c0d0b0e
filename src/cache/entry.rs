//! Cache entry records and size accounting
//!
//! Entries are written once and never rewritten. Only the in-memory LRU
//! index tracks when an entry was last used.

use crate::cache::fingerprint::Fingerprint;
use crate::store::{Artifact, ContentAddress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Convert MB to bytes
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb * 1024 * 1024
}

/// Cache size status relative to configured limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSizeStatus {
    /// Under 80% of limit
    Ok,
    /// Between 80% and 100% of limit
    Warning,
    /// At or over the limit
    Exceeded,
}

impl CacheSizeStatus {
    /// Determine status based on current size and limit
    pub fn from_usage(current_bytes: u64, limit_bytes: u64) -> Self {
        if limit_bytes == 0 {
            return Self::Ok;
        }
        let percent = Self::percentage(current_bytes, limit_bytes);
        if percent >= 100.0 {
            Self::Exceeded
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Get percentage of limit used
    pub fn percentage(current_bytes: u64, limit_bytes: u64) -> f64 {
        if limit_bytes == 0 {
            return 0.0;
        }
        (current_bytes as f64 / limit_bytes as f64) * 100.0
    }
}

/// A previously computed operation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key this entry answers
    pub fingerprint: Fingerprint,

    /// Operation kind that produced it (for diagnostics)
    pub kind: String,

    /// Resulting artifact
    pub result: Artifact,

    /// Captured (and scrubbed) standard output
    pub stdout: Option<ContentAddress>,

    /// Captured (and scrubbed) standard error
    pub stderr: Option<ContentAddress>,

    /// Exit code for exec-like operations
    pub exit_code: Option<i32>,

    /// Stored size of the result and outputs
    pub size_bytes: u64,

    /// When the entry was created
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, kind: impl Into<String>, result: Artifact) -> Self {
        Self {
            fingerprint,
            kind: kind.into(),
            result,
            stdout: None,
            stderr: None,
            exit_code: None,
            size_bytes: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_output(
        mut self,
        stdout: ContentAddress,
        stderr: ContentAddress,
        exit_code: i32,
    ) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self.exit_code = Some(exit_code);
        self
    }

    /// Check if this entry is older than the given number of days
    pub fn is_older_than_days(&self, days: u32) -> bool {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        self.created_at < cutoff
    }

    /// Auxiliary blobs that must be present for the entry to be served
    pub fn output_blobs(&self) -> impl Iterator<Item = &ContentAddress> {
        self.stdout.iter().chain(self.stderr.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::FingerprintBuilder;

    fn entry() -> CacheEntry {
        CacheEntry::new(
            FingerprintBuilder::new("exec").finish(),
            "exec",
            Artifact::dir(ContentAddress::of(b"tree")),
        )
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(mb_to_bytes(3) / 2), "1.5 MB");
    }

    #[test]
    fn size_status_thresholds() {
        assert_eq!(CacheSizeStatus::from_usage(10, 100), CacheSizeStatus::Ok);
        assert_eq!(CacheSizeStatus::from_usage(85, 100), CacheSizeStatus::Warning);
        assert_eq!(CacheSizeStatus::from_usage(100, 100), CacheSizeStatus::Exceeded);
        assert_eq!(CacheSizeStatus::from_usage(100, 0), CacheSizeStatus::Ok);
    }

    #[test]
    fn entry_age() {
        let mut e = entry();
        assert!(!e.is_older_than_days(1));
        e.created_at = Utc::now() - chrono::Duration::days(5);
        assert!(e.is_older_than_days(1));
    }

    #[test]
    fn output_blobs_only_when_present() {
        let e = entry();
        assert_eq!(e.output_blobs().count(), 0);
        let e = e.with_output(ContentAddress::of(b"o"), ContentAddress::of(b"e"), 0);
        assert_eq!(e.output_blobs().count(), 2);
    }
}
