//! Content store
//!
//! Immutable blobs and directory trees on disk, addressed by SHA-256.
//!
//! # Layout
//!
//! | Path | Contents |
//! |------|----------|
//! | `objects/ab/cdef…` | blob bytes, named by their digest |
//! | `tmp/` | in-progress writes, renamed into `objects/` when complete |
//!
//! # Integrity
//!
//! The store is append-only: an address is never rewritten. Writes land in
//! `tmp/` and are renamed into place, so two writers of the same address
//! race harmlessly and no per-address lock is needed. Every read re-hashes
//! the bytes; a mismatch surfaces as `StoreCorruption` and is never served.

pub mod address;
pub mod tree;

pub use address::ContentAddress;
pub use tree::{split_path, EntryKind, Tree, TreeEntry};

use crate::error::{KilnError, KilnResult};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const DEFAULT_DIR_MODE: u32 = 0o755;

/// A file, directory or symlink held in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: EntryKind,
    pub address: ContentAddress,
    pub mode: u32,
}

impl Artifact {
    pub fn dir(address: ContentAddress) -> Self {
        Self {
            kind: EntryKind::Dir,
            address,
            mode: DEFAULT_DIR_MODE,
        }
    }

    pub fn file(address: ContentAddress, mode: u32) -> Self {
        Self {
            kind: EntryKind::File,
            address,
            mode,
        }
    }
}

/// Paths left out of a directory import
#[derive(Debug, Clone, Default)]
pub struct ImportFilter {
    /// Patterns matched against relative paths: exact path, directory
    /// prefix, or `*suffix` against the file name
    pub excludes: Vec<String>,
    /// Relative paths skipped verbatim (secret mount points)
    pub skip: Vec<PathBuf>,
}

impl ImportFilter {
    pub fn excluding(excludes: &[String]) -> Self {
        Self {
            excludes: excludes.to_vec(),
            skip: Vec::new(),
        }
    }

    fn is_excluded(&self, relative: &Path) -> bool {
        if self.skip.iter().any(|s| s == relative) {
            return true;
        }
        let rel = relative.to_string_lossy();
        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        self.excludes.iter().any(|pattern| {
            let pattern = pattern.trim_matches('/');
            if let Some(suffix) = pattern.strip_prefix('*') {
                name.ends_with(suffix)
            } else {
                rel == pattern || rel.starts_with(&format!("{}/", pattern))
            }
        })
    }
}

/// Disk usage of the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub objects: u64,
    pub bytes: u64,
}

/// On-disk identity of an object file when its contents were last hashed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl Stamp {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

/// Content-addressed blob and tree store
pub struct ContentStore {
    root: PathBuf,
    /// File objects already hashed, valid while their file is unchanged
    verified: DashMap<ContentAddress, Stamp>,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> KilnResult<Self> {
        let root = root.into();
        for dir in [root.join(OBJECTS_DIR), root.join(TMP_DIR)] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| KilnError::io(format!("creating {}", dir.display()), e))?;
        }
        debug!("Opened content store at {}", root.display());
        Ok(Self {
            root,
            verified: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, address: &ContentAddress) -> PathBuf {
        let hex = address.hex();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(&hex[2..])
    }

    /// Store bytes, returning their address
    pub async fn put_bytes(&self, bytes: &[u8]) -> KilnResult<ContentAddress> {
        let address = ContentAddress::of(bytes);
        let path = self.object_path(&address);
        if path.exists() {
            return Ok(address);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io("creating object shard", e))?;
        }

        let tmp = self.root.join(TMP_DIR).join(Uuid::new_v4().to_string());
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| KilnError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| KilnError::io(format!("committing object {}", address.short()), e))?;

        Ok(address)
    }

    /// Read and verify a blob
    pub async fn get_bytes(&self, address: &ContentAddress) -> KilnResult<Vec<u8>> {
        let path = self.object_path(address);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KilnError::ContentNotFound(address.to_string()));
            }
            Err(e) => return Err(KilnError::io(format!("reading {}", path.display()), e)),
        };

        let actual = ContentAddress::of(&bytes);
        if actual != *address {
            warn!("Object {} failed integrity check", address.short());
            self.verified.remove(address);
            // Dropped so the next write of this content restores it
            if let Err(e) = fs::remove_file(&path).await {
                warn!("Failed to remove corrupt object {}: {}", address.short(), e);
            }
            return Err(KilnError::StoreCorruption {
                address: address.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    pub async fn contains(&self, address: &ContentAddress) -> bool {
        fs::try_exists(self.object_path(address))
            .await
            .unwrap_or(false)
    }

    pub async fn put_tree(&self, tree: &Tree) -> KilnResult<ContentAddress> {
        self.put_bytes(&tree.to_bytes()?).await
    }

    pub async fn get_tree(&self, address: &ContentAddress) -> KilnResult<Tree> {
        Tree::from_bytes(&self.get_bytes(address).await?)
    }

    pub async fn empty_tree(&self) -> KilnResult<ContentAddress> {
        self.put_tree(&Tree::default()).await
    }

    /// Verify an artifact and everything reachable from it
    ///
    /// Returns the total stored size. Tree manifests are always re-hashed.
    /// A file blob is re-hashed unless it was verified earlier and its file
    /// still has the same length and modification time.
    pub async fn verify_deep(&self, artifact: &Artifact) -> KilnResult<u64> {
        self.verify_entry(artifact.kind, artifact.address).await
    }

    fn verify_entry(&self, kind: EntryKind, address: ContentAddress) -> BoxFuture<'_, KilnResult<u64>> {
        Box::pin(async move {
            if kind == EntryKind::Dir {
                let bytes = self.get_bytes(&address).await?;
                let mut total = bytes.len() as u64;
                for entry in Tree::from_bytes(&bytes)?.entries() {
                    total += self.verify_entry(entry.kind, entry.address).await?;
                }
                return Ok(total);
            }

            let path = self.object_path(&address);
            let before = match fs::metadata(&path).await {
                Ok(meta) => Stamp::of(&meta),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(KilnError::ContentNotFound(address.to_string()));
                }
                Err(e) => return Err(KilnError::io(format!("reading {}", path.display()), e)),
            };
            if self.verified.get(&address).is_some_and(|s| *s == before) {
                return Ok(before.len);
            }
            let len = self.get_bytes(&address).await?.len() as u64;
            self.verified.insert(address, before);
            Ok(len)
        })
    }

    /// Import a host directory as a tree
    pub async fn import_dir(&self, dir: &Path, filter: &ImportFilter) -> KilnResult<ContentAddress> {
        if !dir.is_dir() {
            return Err(KilnError::PathNotFound(dir.to_path_buf()));
        }
        self.import_recursive(dir.to_path_buf(), PathBuf::new(), filter)
            .await
    }

    fn import_recursive<'a>(
        &'a self,
        dir: PathBuf,
        relative: PathBuf,
        filter: &'a ImportFilter,
    ) -> BoxFuture<'a, KilnResult<ContentAddress>> {
        Box::pin(async move {
            let mut tree = Tree::default();
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| KilnError::io(format!("reading {}", dir.display()), e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| KilnError::io(format!("reading {}", dir.display()), e))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                let rel = relative.join(&name);
                if filter.is_excluded(&rel) {
                    continue;
                }

                let path = entry.path();
                let meta = fs::symlink_metadata(&path)
                    .await
                    .map_err(|e| KilnError::io(format!("stat {}", path.display()), e))?;
                let mode = permission_bits(&meta);

                let (kind, address) = if meta.file_type().is_symlink() {
                    let target = fs::read_link(&path)
                        .await
                        .map_err(|e| KilnError::io(format!("readlink {}", path.display()), e))?;
                    let address = self
                        .put_bytes(target.to_string_lossy().as_bytes())
                        .await?;
                    (EntryKind::Symlink, address)
                } else if meta.is_dir() {
                    let address = self.import_recursive(path, rel, filter).await?;
                    (EntryKind::Dir, address)
                } else if meta.is_file() {
                    let bytes = fs::read(&path)
                        .await
                        .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
                    (EntryKind::File, self.put_bytes(&bytes).await?)
                } else {
                    debug!("Skipping special file {}", path.display());
                    continue;
                };

                tree.insert(TreeEntry {
                    name,
                    kind,
                    mode,
                    address,
                })?;
            }

            self.put_tree(&tree).await
        })
    }

    /// Write a tree out to `dest`, creating it if needed
    pub async fn materialize(&self, tree: &ContentAddress, dest: &Path) -> KilnResult<()> {
        fs::create_dir_all(dest)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", dest.display()), e))?;
        self.materialize_tree(*tree, dest.to_path_buf()).await
    }

    fn materialize_tree(&self, tree: ContentAddress, dest: PathBuf) -> BoxFuture<'_, KilnResult<()>> {
        Box::pin(async move {
            let tree = self.get_tree(&tree).await?;
            for entry in tree.entries() {
                let path = dest.join(&entry.name);
                let artifact = Artifact {
                    kind: entry.kind,
                    address: entry.address,
                    mode: entry.mode,
                };
                self.write_artifact(&artifact, &path).await?;
                if entry.kind == EntryKind::Dir {
                    self.materialize_tree(entry.address, path).await?;
                    set_mode(&dest.join(&entry.name), entry.mode).await?;
                }
            }
            Ok(())
        })
    }

    /// Write a single artifact (without recursing into directories)
    async fn write_artifact(&self, artifact: &Artifact, path: &Path) -> KilnResult<()> {
        match artifact.kind {
            EntryKind::Dir => fs::create_dir_all(path)
                .await
                .map_err(|e| KilnError::io(format!("creating {}", path.display()), e)),
            EntryKind::File => {
                let bytes = self.get_bytes(&artifact.address).await?;
                fs::write(path, bytes)
                    .await
                    .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))?;
                set_mode(path, artifact.mode).await
            }
            EntryKind::Symlink => {
                let target = String::from_utf8(self.get_bytes(&artifact.address).await?)
                    .map_err(|_| KilnError::Internal("symlink target is not UTF-8".to_string()))?;
                create_symlink(&target, path).await
            }
        }
    }

    /// Write any artifact to a host path (used by exports)
    pub async fn export(&self, artifact: &Artifact, dest: &Path) -> KilnResult<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;
        }
        match artifact.kind {
            EntryKind::Dir => self.materialize(&artifact.address, dest).await,
            _ => self.write_artifact(artifact, dest).await,
        }
    }

    /// Find the entry at `path` inside a tree
    pub async fn lookup(&self, tree: &ContentAddress, path: &str) -> KilnResult<Artifact> {
        let mut current = Artifact::dir(*tree);
        for part in split_path(path)? {
            if current.kind != EntryKind::Dir {
                return Err(KilnError::InvalidTreePath(path.to_string()));
            }
            let tree = self.get_tree(&current.address).await?;
            let entry = tree
                .get(part)
                .ok_or_else(|| KilnError::InvalidTreePath(format!("{} (no such entry)", path)))?;
            current = Artifact {
                kind: entry.kind,
                address: entry.address,
                mode: entry.mode,
            };
        }
        Ok(current)
    }

    /// Place `artifact` at `path` inside `base`, creating parent directories
    ///
    /// Placing a directory at the root replaces the whole tree.
    pub async fn with_artifact(
        &self,
        base: &ContentAddress,
        path: &str,
        artifact: &Artifact,
    ) -> KilnResult<ContentAddress> {
        let parts: Vec<String> = split_path(path)?.into_iter().map(str::to_string).collect();
        if parts.is_empty() {
            if artifact.kind != EntryKind::Dir {
                return Err(KilnError::InvalidTreePath(path.to_string()));
            }
            return Ok(artifact.address);
        }
        self.place(*base, parts, *artifact).await
    }

    fn place(
        &self,
        base: ContentAddress,
        mut parts: Vec<String>,
        artifact: Artifact,
    ) -> BoxFuture<'_, KilnResult<ContentAddress>> {
        Box::pin(async move {
            let mut tree = self.get_tree(&base).await?;
            let name = parts.remove(0);

            let entry = if parts.is_empty() {
                TreeEntry {
                    name,
                    kind: artifact.kind,
                    mode: artifact.mode,
                    address: artifact.address,
                }
            } else {
                let (child, mode) = match tree.get(&name) {
                    Some(existing) if existing.kind == EntryKind::Dir => {
                        (existing.address, existing.mode)
                    }
                    _ => (self.empty_tree().await?, DEFAULT_DIR_MODE),
                };
                TreeEntry {
                    name,
                    kind: EntryKind::Dir,
                    mode,
                    address: self.place(child, parts, artifact).await?,
                }
            };

            tree.insert(entry)?;
            self.put_tree(&tree).await
        })
    }

    /// Count objects and bytes on disk
    pub async fn usage(&self) -> KilnResult<StoreUsage> {
        let mut usage = StoreUsage::default();
        let objects = self.root.join(OBJECTS_DIR);
        let mut shards = fs::read_dir(&objects)
            .await
            .map_err(|e| KilnError::io("reading object shards", e))?;

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| KilnError::io("reading object shard", e))?
        {
            let mut files = fs::read_dir(shard.path())
                .await
                .map_err(|e| KilnError::io("reading object shard", e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| KilnError::io("reading object", e))?
            {
                if let Ok(meta) = file.metadata().await {
                    usage.objects += 1;
                    usage.bytes += meta.len();
                }
            }
        }
        Ok(usage)
    }

    /// Remove leftovers of interrupted writes
    pub async fn flush(&self) -> KilnResult<()> {
        let tmp = self.root.join(TMP_DIR);
        let mut entries = fs::read_dir(&tmp)
            .await
            .map_err(|e| KilnError::io("reading store tmp dir", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KilnError::io("reading store tmp entry", e))?
        {
            let _ = fs::remove_file(entry.path()).await;
        }
        Ok(())
    }

    /// On-disk path of a stored object, for corrupting it in tests
    #[cfg(test)]
    pub(crate) fn object_path_for_tests(&self, address: &ContentAddress) -> PathBuf {
        self.object_path(address)
    }
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        DEFAULT_DIR_MODE
    } else {
        0o644
    }
}

async fn set_mode(path: &Path, mode: u32) -> KilnResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| KilnError::io(format!("setting mode on {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

async fn create_symlink(target: &str, path: &Path) -> KilnResult<()> {
    #[cfg(unix)]
    {
        fs::symlink(target, path)
            .await
            .map_err(|e| KilnError::io(format!("creating symlink {}", path.display()), e))
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(KilnError::UnsupportedPlatform(format!(
            "symlinks at {}",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (ContentStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path().join("store")).await.unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let (store, _temp) = test_store().await;
        let a = store.put_bytes(b"hello").await.unwrap();
        let b = store.put_bytes(b"hello").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.get_bytes(&a).await.unwrap(), b"hello");
        assert_eq!(store.usage().await.unwrap().objects, 1);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (store, _temp) = test_store().await;
        let addr = ContentAddress::of(b"never stored");
        assert!(matches!(
            store.get_bytes(&addr).await,
            Err(KilnError::ContentNotFound(_))
        ));
        assert!(!store.contains(&addr).await);
    }

    #[tokio::test]
    async fn corrupted_object_is_detected() {
        let (store, _temp) = test_store().await;
        let addr = store.put_bytes(b"original").await.unwrap();
        std::fs::write(store.object_path_for_tests(&addr), b"tampered").unwrap();

        assert!(matches!(
            store.get_bytes(&addr).await,
            Err(KilnError::StoreCorruption { .. })
        ));

        // Writing the same content again repairs the object
        store.put_bytes(b"original").await.unwrap();
        assert_eq!(store.get_bytes(&addr).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn import_and_materialize_roundtrip() {
        let (store, temp) = test_store().await;
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a.txt"), "alpha").unwrap();
        std::fs::write(src.join("sub/b.txt"), "beta").unwrap();
        std::fs::write(src.join("debug.log"), "noise").unwrap();
        std::fs::create_dir_all(src.join("target")).unwrap();
        std::fs::write(src.join("target/out"), "build").unwrap();

        let filter = ImportFilter::excluding(&["*.log".to_string(), "target".to_string()]);
        let tree = store.import_dir(&src, &filter).await.unwrap();

        let dest = temp.path().join("dest");
        store.materialize(&tree, &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("a.txt")).unwrap(), "alpha");
        assert_eq!(std::fs::read_to_string(dest.join("sub/b.txt")).unwrap(), "beta");
        assert!(!dest.join("debug.log").exists());
        assert!(!dest.join("target").exists());

        // Same contents always produce the same tree
        let again = store.import_dir(&dest, &ImportFilter::default()).await.unwrap();
        assert_eq!(again, tree);
    }

    #[tokio::test]
    async fn with_artifact_and_lookup() {
        let (store, _temp) = test_store().await;
        let empty = store.empty_tree().await.unwrap();
        let blob = store.put_bytes(b"config").await.unwrap();

        let tree = store
            .with_artifact(&empty, "/etc/app/config.toml", &Artifact::file(blob, 0o600))
            .await
            .unwrap();

        let found = store.lookup(&tree, "etc/app/config.toml").await.unwrap();
        assert_eq!(found.kind, EntryKind::File);
        assert_eq!(found.address, blob);
        assert_eq!(found.mode, 0o600);

        let dir = store.lookup(&tree, "/etc").await.unwrap();
        assert_eq!(dir.kind, EntryKind::Dir);
        assert!(store.lookup(&tree, "/etc/missing").await.is_err());
    }

    #[tokio::test]
    async fn verify_deep_finds_nested_corruption() {
        let (store, _temp) = test_store().await;
        let empty = store.empty_tree().await.unwrap();
        let blob = store.put_bytes(b"payload").await.unwrap();
        let tree = store
            .with_artifact(&empty, "/data/file", &Artifact::file(blob, 0o644))
            .await
            .unwrap();

        assert!(store.verify_deep(&Artifact::dir(tree)).await.is_ok());

        std::fs::write(store.object_path_for_tests(&blob), b"junk").unwrap();
        assert!(matches!(
            store.verify_deep(&Artifact::dir(tree)).await,
            Err(KilnError::StoreCorruption { .. })
        ));
    }

    #[tokio::test]
    async fn export_single_file() {
        let (store, temp) = test_store().await;
        let blob = store.put_bytes(b"report").await.unwrap();
        let dest = temp.path().join("out/report.txt");
        store
            .export(&Artifact::file(blob, 0o644), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "report");
    }
}
