//! Operation cache
//!
//! Maps a `Fingerprint` to the result of a previous evaluation. Entries are
//! JSON files under `entries/`, one per fingerprint, written atomically and
//! never rewritten.
//!
//! # Integrity
//!
//! A hit is only served after its result (and captured output blobs) pass
//! verification against the content store. A failing entry is removed and
//! reported as `Corrupt`, which callers treat as a miss and recompute.
//!
//! # Eviction
//!
//! An in-memory LRU index tracks last use. Inserting past `max_entries` or
//! `max_total_bytes` evicts least-recently-used entries. Last-use times are
//! persisted to `index.json` on `flush`.

pub mod entry;
pub mod fingerprint;

pub use entry::{format_bytes, mb_to_bytes, CacheEntry, CacheSizeStatus};
pub use fingerprint::{Fingerprint, FingerprintBuilder};

use crate::error::{KilnError, KilnResult};
use crate::store::ContentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ENTRIES_DIR: &str = "entries";
const INDEX_FILE: &str = "index.json";

/// Size limits that trigger LRU eviction
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_total_bytes: mb_to_bytes(10 * 1024),
        }
    }
}

/// Outcome of a cache lookup
#[derive(Debug)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
    /// The entry existed but failed verification and has been dropped
    Corrupt(KilnError),
}

/// Cache counters since the cache was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub corruptions: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    tick: u64,
    size: u64,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

#[derive(Default)]
struct LruIndex {
    slots: HashMap<Fingerprint, Slot>,
    order: BTreeMap<u64, Fingerprint>,
    next_tick: u64,
    total_bytes: u64,
}

impl LruIndex {
    fn touch(&mut self, fp: &Fingerprint) {
        let tick = self.next_tick;
        if let Some(slot) = self.slots.get_mut(fp) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            slot.last_used = Utc::now();
            self.order.insert(tick, *fp);
            self.next_tick += 1;
        }
    }

    fn insert(&mut self, fp: Fingerprint, size: u64, created_at: DateTime<Utc>, last_used: DateTime<Utc>) {
        self.remove(&fp);
        let tick = self.next_tick;
        self.next_tick += 1;
        self.slots.insert(
            fp,
            Slot {
                tick,
                size,
                created_at,
                last_used,
            },
        );
        self.order.insert(tick, fp);
        self.total_bytes += size;
    }

    fn remove(&mut self, fp: &Fingerprint) -> bool {
        match self.slots.remove(fp) {
            Some(slot) => {
                self.order.remove(&slot.tick);
                self.total_bytes = self.total_bytes.saturating_sub(slot.size);
                true
            }
            None => false,
        }
    }

    fn oldest(&self) -> Option<Fingerprint> {
        self.order.values().next().copied()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    last_used: BTreeMap<Fingerprint, DateTime<Utc>>,
}

/// Fingerprint → result cache backed by the content store
pub struct OperationCache {
    root: PathBuf,
    store: Arc<ContentStore>,
    limits: CacheLimits,
    index: Mutex<LruIndex>,
    hits: AtomicU64,
    misses: AtomicU64,
    corruptions: AtomicU64,
    evictions: AtomicU64,
}

impl OperationCache {
    /// Open the cache, loading every readable entry into the LRU index
    pub async fn open(
        root: impl Into<PathBuf>,
        limits: CacheLimits,
        store: Arc<ContentStore>,
    ) -> KilnResult<Self> {
        let root = root.into();
        let entries_dir = root.join(ENTRIES_DIR);
        fs::create_dir_all(&entries_dir)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", entries_dir.display()), e))?;

        let last_used = load_persisted_index(&root.join(INDEX_FILE)).await;
        let mut loaded: Vec<CacheEntry> = Vec::new();

        let mut dir = fs::read_dir(&entries_dir)
            .await
            .map_err(|e| KilnError::io("reading cache entries", e))?;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| KilnError::io("reading cache entry", e))?
        {
            let path = item.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match read_entry(&path).await {
                Ok(entry) => loaded.push(entry),
                // Left in place; lookup of this fingerprint reports it as corrupt
                Err(e) => warn!("Unreadable cache entry {}: {}", path.display(), e),
            }
        }

        loaded.sort_by_key(|e| last_used.get(&e.fingerprint).copied().unwrap_or(e.created_at));
        let mut index = LruIndex::default();
        for entry in &loaded {
            let used = last_used
                .get(&entry.fingerprint)
                .copied()
                .unwrap_or(entry.created_at);
            index.insert(entry.fingerprint, entry.size_bytes, entry.created_at, used);
        }

        debug!("Opened operation cache with {} entries", index.slots.len());
        Ok(Self {
            root,
            store,
            limits,
            index: Mutex::new(index),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    fn entry_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(ENTRIES_DIR).join(format!("{}.json", fp.hex()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruIndex> {
        // The index holds no invariants that a panic mid-update could break
        // beyond stale accounting, so a poisoned lock is still usable.
        self.index.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Look up a fingerprint, verifying the stored result before serving it
    pub async fn lookup(&self, fp: &Fingerprint) -> CacheLookup {
        let path = self.entry_path(fp);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::Miss;
        }

        let entry = match read_entry(&path).await {
            Ok(entry) if entry.fingerprint == *fp => entry,
            Ok(_) => {
                return self
                    .drop_corrupt(fp, "entry does not match its fingerprint".to_string())
                    .await
            }
            Err(e) => return self.drop_corrupt(fp, e.to_string()).await,
        };

        if let Err(e) = self.verify_entry(&entry).await {
            return self.drop_corrupt(fp, e.to_string()).await;
        }

        {
            let mut index = self.lock();
            if index.slots.contains_key(fp) {
                index.touch(fp);
            } else {
                index.insert(*fp, entry.size_bytes, entry.created_at, Utc::now());
            }
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!("Cache hit {} ({})", fp.short(), entry.kind);
        CacheLookup::Hit(entry)
    }

    async fn verify_entry(&self, entry: &CacheEntry) -> KilnResult<u64> {
        let mut size = self.store.verify_deep(&entry.result).await?;
        for blob in entry.output_blobs() {
            size += self.store.get_bytes(blob).await?.len() as u64;
        }
        Ok(size)
    }

    async fn drop_corrupt(&self, fp: &Fingerprint, reason: String) -> CacheLookup {
        warn!("Cache entry {} failed verification: {}", fp.short(), reason);
        self.corruptions.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.remove(fp).await {
            warn!("Failed to remove corrupt cache entry {}: {}", fp.short(), e);
        }
        CacheLookup::Corrupt(KilnError::CacheCorruption {
            fingerprint: fp.hex(),
            reason,
        })
    }

    /// Record a new entry, then evict down to the configured limits
    pub async fn insert(&self, mut entry: CacheEntry) -> KilnResult<()> {
        entry.size_bytes = self.verify_entry(&entry).await?;

        let path = self.entry_path(&entry.fingerprint);
        let tmp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let content = serde_json::to_vec_pretty(&entry)?;
        fs::write(&tmp, content)
            .await
            .map_err(|e| KilnError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| KilnError::io(format!("committing {}", path.display()), e))?;

        self.lock().insert(
            entry.fingerprint,
            entry.size_bytes,
            entry.created_at,
            Utc::now(),
        );
        debug!(
            "Cached {} result for {} ({})",
            entry.kind,
            entry.fingerprint.short(),
            format_bytes(entry.size_bytes)
        );

        self.evict_to_limits().await?;
        Ok(())
    }

    /// Mark an entry as recently used; returns whether it is indexed
    pub fn touch(&self, fp: &Fingerprint) -> bool {
        let mut index = self.lock();
        let known = index.slots.contains_key(fp);
        index.touch(fp);
        known
    }

    /// Evict least-recently-used entries until within limits
    pub async fn evict_to_limits(&self) -> KilnResult<usize> {
        let mut evicted = 0;
        loop {
            let victim = {
                let index = self.lock();
                let over = index.slots.len() > self.limits.max_entries
                    || index.total_bytes > self.limits.max_total_bytes;
                if !over {
                    break;
                }
                index.oldest()
            };
            let Some(victim) = victim else { break };
            self.remove(&victim).await?;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            evicted += 1;
            debug!("Evicted cache entry {}", victim.short());
        }
        Ok(evicted)
    }

    /// Remove one entry
    pub async fn remove(&self, fp: &Fingerprint) -> KilnResult<bool> {
        let known = self.lock().remove(fp);
        let path = self.entry_path(fp);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(known),
            Err(e) => Err(KilnError::io(format!("removing {}", path.display()), e)),
        }
    }

    /// Remove entries created more than `days` days ago
    pub async fn gc(&self, days: u32) -> KilnResult<usize> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let stale: Vec<Fingerprint> = self
            .lock()
            .slots
            .iter()
            .filter(|(_, slot)| slot.created_at < cutoff)
            .map(|(fp, _)| *fp)
            .collect();

        for fp in &stale {
            self.remove(fp).await?;
        }
        if !stale.is_empty() {
            info!("Removed {} cache entries older than {} days", stale.len(), days);
        }
        Ok(stale.len())
    }

    /// Verify every entry, dropping the ones that fail
    ///
    /// Returns `(checked, removed)`.
    pub async fn verify_all(&self) -> KilnResult<(usize, usize)> {
        let mut paths = Vec::new();
        let mut dir = fs::read_dir(self.root.join(ENTRIES_DIR))
            .await
            .map_err(|e| KilnError::io("reading cache entries", e))?;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| KilnError::io("reading cache entry", e))?
        {
            paths.push(item.path());
        }

        let mut removed = 0;
        for path in &paths {
            let Some(fp) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<Fingerprint>().ok())
            else {
                continue;
            };
            if let CacheLookup::Corrupt(_) = self.lookup(&fp).await {
                removed += 1;
            }
        }
        Ok((paths.len(), removed))
    }

    /// Remove all entries
    pub async fn clear(&self) -> KilnResult<usize> {
        let all: Vec<Fingerprint> = self.lock().slots.keys().copied().collect();
        for fp in &all {
            self.remove(fp).await?;
        }
        Ok(all.len())
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.lock();
        CacheStats {
            entries: index.slots.len(),
            total_bytes: index.total_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    /// Persist last-use times so LRU order survives restarts
    pub async fn flush(&self) -> KilnResult<()> {
        let persisted = PersistedIndex {
            last_used: self
                .lock()
                .slots
                .iter()
                .map(|(fp, slot)| (*fp, slot.last_used))
                .collect(),
        };
        let path = self.root.join(INDEX_FILE);
        fs::write(&path, serde_json::to_vec(&persisted)?)
            .await
            .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))
    }
}

async fn read_entry(path: &Path) -> KilnResult<CacheEntry> {
    let content = fs::read(path)
        .await
        .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
    Ok(serde_json::from_slice(&content)?)
}

async fn load_persisted_index(path: &Path) -> HashMap<Fingerprint, DateTime<Utc>> {
    let Ok(content) = fs::read(path).await else {
        return HashMap::new();
    };
    match serde_json::from_slice::<PersistedIndex>(&content) {
        Ok(index) => index.last_used.into_iter().collect(),
        Err(e) => {
            warn!("Ignoring unreadable cache index: {}", e);
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Artifact;
    use tempfile::TempDir;

    async fn setup(limits: CacheLimits) -> (OperationCache, Arc<ContentStore>, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::open(temp.path().join("store")).await.unwrap());
        let cache = OperationCache::open(temp.path().join("cache"), limits, store.clone())
            .await
            .unwrap();
        (cache, store, temp)
    }

    async fn entry_for(store: &ContentStore, name: &str) -> CacheEntry {
        let blob = store.put_bytes(name.as_bytes()).await.unwrap();
        let out = store.put_bytes(b"stdout").await.unwrap();
        let err = store.put_bytes(b"").await.unwrap();
        CacheEntry::new(
            FingerprintBuilder::new("exec").str("name", name).finish(),
            "exec",
            Artifact::file(blob, 0o644),
        )
        .with_output(out, err, 0)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let (cache, store, _temp) = setup(CacheLimits::default()).await;
        let entry = entry_for(&store, "a").await;
        let fp = entry.fingerprint;

        assert!(matches!(cache.lookup(&fp).await, CacheLookup::Miss));
        cache.insert(entry.clone()).await.unwrap();

        match cache.lookup(&fp).await {
            CacheLookup::Hit(hit) => assert_eq!(hit.result, entry.result),
            other => panic!("expected hit, got {:?}", other),
        }
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[tokio::test]
    async fn corrupted_result_is_never_served() {
        let (cache, store, _temp) = setup(CacheLimits::default()).await;
        let entry = entry_for(&store, "precious").await;
        let fp = entry.fingerprint;
        cache.insert(entry.clone()).await.unwrap();

        std::fs::write(store.object_path_for_tests(&entry.result.address), b"bitrot").unwrap();

        assert!(matches!(
            cache.lookup(&fp).await,
            CacheLookup::Corrupt(KilnError::CacheCorruption { .. })
        ));
        // Dropped: the next lookup is a plain miss
        assert!(matches!(cache.lookup(&fp).await, CacheLookup::Miss));
        assert_eq!(cache.stats().corruptions, 1);
    }

    #[tokio::test]
    async fn lru_eviction_by_count() {
        let limits = CacheLimits {
            max_entries: 2,
            max_total_bytes: u64::MAX,
        };
        let (cache, store, _temp) = setup(limits).await;
        let a = entry_for(&store, "a").await;
        let b = entry_for(&store, "b").await;
        let c = entry_for(&store, "c").await;

        cache.insert(a.clone()).await.unwrap();
        cache.insert(b.clone()).await.unwrap();
        // Touch `a` so `b` becomes least recently used
        assert!(matches!(cache.lookup(&a.fingerprint).await, CacheLookup::Hit(_)));
        cache.insert(c.clone()).await.unwrap();

        assert!(matches!(cache.lookup(&b.fingerprint).await, CacheLookup::Miss));
        assert!(matches!(cache.lookup(&a.fingerprint).await, CacheLookup::Hit(_)));
        assert!(matches!(cache.lookup(&c.fingerprint).await, CacheLookup::Hit(_)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let (cache, store, temp) = setup(CacheLimits::default()).await;
        let entry = entry_for(&store, "persist").await;
        cache.insert(entry.clone()).await.unwrap();
        cache.flush().await.unwrap();
        drop(cache);

        let reopened = OperationCache::open(temp.path().join("cache"), CacheLimits::default(), store)
            .await
            .unwrap();
        assert_eq!(reopened.stats().entries, 1);
        assert!(matches!(
            reopened.lookup(&entry.fingerprint).await,
            CacheLookup::Hit(_)
        ));
    }

    #[tokio::test]
    async fn gc_and_clear() {
        let (cache, store, _temp) = setup(CacheLimits::default()).await;
        let mut old = entry_for(&store, "old").await;
        old.created_at = Utc::now() - chrono::Duration::days(40);
        let fresh = entry_for(&store, "fresh").await;
        cache.insert(old).await.unwrap();
        cache.insert(fresh).await.unwrap();

        assert_eq!(cache.gc(30).await.unwrap(), 1);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn verify_all_drops_broken_entries() {
        let (cache, store, _temp) = setup(CacheLimits::default()).await;
        let good = entry_for(&store, "good").await;
        let bad = entry_for(&store, "bad").await;
        cache.insert(good).await.unwrap();
        cache.insert(bad.clone()).await.unwrap();
        std::fs::write(store.object_path_for_tests(&bad.result.address), b"x").unwrap();

        assert_eq!(cache.verify_all().await.unwrap(), (2, 1));
        assert_eq!(cache.stats().entries, 1);
    }
}
