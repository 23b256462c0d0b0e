//! Directory tree manifests

use crate::error::{KilnError, KilnResult};
use crate::store::address::ContentAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Dir => write!(f, "dir"),
            Self::Symlink => write!(f, "symlink"),
        }
    }
}

/// One named entry of a tree
///
/// For files the address points at the contents, for directories at the
/// nested tree manifest, for symlinks at the link target bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub address: ContentAddress,
}

/// Canonical directory manifest, entries sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(entries: Vec<TreeEntry>) -> KilnResult<Self> {
        let mut tree = Self::default();
        for entry in entries {
            tree.insert(entry)?;
        }
        Ok(tree)
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, entry: TreeEntry) -> KilnResult<()> {
        validate_name(&entry.name)?;
        match self
            .entries
            .binary_search_by(|e| e.name.as_str().cmp(&entry.name))
        {
            Ok(i) => self.entries[i] = entry,
            Err(i) => self.entries.insert(i, entry),
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| self.entries.remove(i))
    }

    /// Canonical serialized form; its digest is the tree address
    pub fn to_bytes(&self) -> KilnResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> KilnResult<Self> {
        let tree: Tree = serde_json::from_slice(bytes)?;
        let sorted = tree.entries.windows(2).all(|w| w[0].name < w[1].name);
        if !sorted {
            return Err(KilnError::Internal("tree manifest is not canonical".to_string()));
        }
        Ok(tree)
    }
}

fn validate_name(name: &str) -> KilnResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(KilnError::InvalidTreePath(name.to_string()));
    }
    Ok(())
}

/// Split a sandbox path into normalized components
///
/// Leading slashes and `.` components are ignored; `..` is rejected.
pub fn split_path(path: &str) -> KilnResult<Vec<&str>> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(KilnError::InvalidTreePath(path.to_string())),
            other => parts.push(other),
        }
    }
    Ok(parts)
}
