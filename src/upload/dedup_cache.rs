//! Deduplication Cache
//!
//! Content-addressed index from file digest to a stored artifact. Bounded
//! by total size and entry count with LRU eviction; entries also expire
//! after a TTL, whichever comes first.
//!
//! # Locking
//!
//! The table is behind an async `RwLock`; each entry has its own mutex for
//! access statistics. Lookups only take the table's read lock, so hits on
//! different digests never serialize. Inserts, evictions and sweeps take
//! the write lock.
//!
//! Eviction and expiry use ordered indexes kept under the write lock. Hits
//! never touch the LRU index; an entry filed under a stale key is refiled
//! when eviction reaches it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::RwLock;

// ============================================================================
// Configuration
// ============================================================================

/// Cache bounds
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum summed artifact size in bytes
    pub max_size: u64,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Lifetime of an entry from its creation
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10 * 1024 * 1024 * 1024,
            max_entries: 10_000,
            ttl: Duration::days(7),
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

/// A cached artifact
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub digest: String,
    #[serde(skip)]
    pub artifact_path: PathBuf,
    pub size: u64,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    #[serde(skip)]
    pub ttl: Duration,
    /// Logical access clock, orders accesses within one timestamp
    #[serde(skip)]
    seq: u64,
    /// Clock value at registration; identifies this registration
    #[serde(skip)]
    generation: u64,
}

type EvictionKey = (DateTime<Utc>, u64, u64);
type ExpiryKey = (DateTime<Utc>, u64);

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > self.ttl
    }

    /// LRU ordering key; ties on time go to the less used entry
    fn eviction_key(&self) -> EvictionKey {
        (self.last_access, self.access_count, self.seq)
    }

    fn expiry_key(&self) -> ExpiryKey {
        let expires_at = self
            .created_at
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (expires_at, self.generation)
    }
}

/// Registration result
#[derive(Debug, Clone)]
pub struct Registered {
    pub entry: CacheEntry,
    /// A live entry for the same digest was replaced
    pub replaced: bool,
}

struct Slot {
    entry: Arc<Mutex<CacheEntry>>,
    /// Key under which the entry is filed in `lru`; trails hits
    lru_key: EvictionKey,
    expiry_key: ExpiryKey,
}

#[derive(Default)]
struct CacheTable {
    entries: HashMap<String, Slot>,
    lru: BTreeMap<EvictionKey, String>,
    expiry: BTreeMap<ExpiryKey, String>,
    total_size: u64,
}

impl CacheTable {
    fn insert(&mut self, entry: CacheEntry) {
        let digest = entry.digest.clone();
        let lru_key = entry.eviction_key();
        let expiry_key = entry.expiry_key();

        self.total_size += entry.size;
        self.lru.insert(lru_key, digest.clone());
        self.expiry.insert(expiry_key, digest.clone());
        self.entries.insert(
            digest,
            Slot {
                entry: Arc::new(Mutex::new(entry)),
                lru_key,
                expiry_key,
            },
        );
    }

    fn remove(&mut self, digest: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(digest)?;
        self.lru.remove(&slot.lru_key);
        self.expiry.remove(&slot.expiry_key);

        let entry = slot.entry.lock().clone();
        self.total_size -= entry.size;
        Some(entry)
    }

    fn expired_digests(&self, now: DateTime<Utc>) -> Vec<String> {
        self.expiry
            .iter()
            .take_while(|((expires_at, _), _)| *expires_at < now)
            .map(|(_, digest)| digest.clone())
            .collect()
    }

    /// Remove and return the least recently used entry
    fn pop_lru(&mut self) -> Option<CacheEntry> {
        loop {
            let (key, digest) = self.lru.pop_first()?;
            let Some(slot) = self.entries.get_mut(&digest) else {
                continue;
            };

            let current = slot.entry.lock().eviction_key();
            if current == key {
                return self.remove(&digest);
            }

            // Hit since it was filed; keys only grow, so refile and go on
            slot.lru_key = current;
            self.lru.insert(current, digest);
        }
    }
}

// ============================================================================
// Dedup Cache
// ============================================================================

/// Content-addressed artifact cache with LRU + TTL eviction
#[derive(Clone)]
pub struct DedupCache {
    inner: Arc<DedupCacheInner>,
}

struct DedupCacheInner {
    table: RwLock<CacheTable>,
    config: CacheConfig,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl DedupCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(DedupCacheInner {
                table: RwLock::new(CacheTable::default()),
                config,
                clock: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                expirations: AtomicU64::new(0),
            }),
        }
    }

    fn tick(&self) -> u64 {
        self.inner.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a digest, recording the access on a hit
    pub async fn lookup(&self, digest: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        let expired = {
            let table = self.inner.table.read().await;
            match table.entries.get(digest) {
                None => false,
                Some(slot) => {
                    let mut entry = slot.entry.lock();
                    if entry.is_expired(now) {
                        true
                    } else {
                        entry.access_count += 1;
                        entry.last_access = now;
                        entry.seq = self.tick();
                        let hit = entry.clone();
                        drop(entry);

                        self.inner.hits.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            digest = %digest,
                            access_count = hit.access_count,
                            "Dedup cache hit"
                        );
                        return Some(hit);
                    }
                }
            }
        };

        if expired {
            let mut table = self.inner.table.write().await;
            // Re-check under the write lock; the entry may have been replaced
            let still_expired = table
                .entries
                .get(digest)
                .map(|slot| slot.entry.lock().is_expired(now))
                .unwrap_or(false);
            if still_expired {
                table.remove(digest);
                self.inner.expirations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(digest = %digest, "Dedup cache entry expired on lookup");
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Register an artifact, evicting LRU entries to stay within bounds
    ///
    /// Returns `None` when the artifact alone exceeds `max_size`.
    pub async fn insert(
        &self,
        digest: &str,
        artifact_path: PathBuf,
        size: u64,
        encrypted: bool,
    ) -> Option<Registered> {
        let config = &self.inner.config;
        if size > config.max_size || config.max_entries == 0 {
            tracing::warn!(
                digest = %digest,
                size = size,
                max_size = config.max_size,
                "Artifact too large for dedup cache, not cached"
            );
            return None;
        }

        let now = Utc::now();
        let mut table = self.inner.table.write().await;

        let expired = self.sweep_locked(&mut table, now);
        let replaced = table.remove(digest).is_some();

        let mut evicted = 0u64;
        while !table.entries.is_empty()
            && (table.total_size + size > config.max_size
                || table.entries.len() >= config.max_entries)
        {
            let Some(entry) = table.pop_lru() else {
                break;
            };
            evicted += 1;
            tracing::debug!(
                digest = %entry.digest,
                size = entry.size,
                access_count = entry.access_count,
                "Evicted LRU dedup cache entry"
            );
        }
        self.inner.evictions.fetch_add(evicted, Ordering::Relaxed);

        let generation = self.tick();
        let entry = CacheEntry {
            digest: digest.to_string(),
            artifact_path,
            size,
            encrypted,
            created_at: now,
            last_access: now,
            access_count: 0,
            ttl: config.ttl,
            seq: generation,
            generation,
        };
        table.insert(entry.clone());

        tracing::info!(
            digest = %digest,
            size = size,
            entries = table.entries.len(),
            total_size = table.total_size,
            evicted = evicted,
            expired = expired,
            replaced = replaced,
            "Registered artifact in dedup cache"
        );

        Some(Registered { entry, replaced })
    }

    /// Undo a registration unless the digest was registered again since
    pub async fn retract(&self, registered: &CacheEntry) -> bool {
        let mut table = self.inner.table.write().await;
        let current = table
            .entries
            .get(&registered.digest)
            .map(|slot| slot.entry.lock().generation);
        if current != Some(registered.generation) {
            return false;
        }

        table.remove(&registered.digest);
        tracing::info!(digest = %registered.digest, "Retracted dedup cache entry");
        true
    }

    /// Remove one entry
    pub async fn invalidate(&self, digest: &str) -> Option<CacheEntry> {
        let mut table = self.inner.table.write().await;
        let removed = table.remove(digest);
        if removed.is_some() {
            tracing::info!(digest = %digest, "Invalidated dedup cache entry");
        }
        removed
    }

    /// Remove every entry, returning how many were dropped
    pub async fn clear(&self) -> usize {
        let mut table = self.inner.table.write().await;
        let count = table.entries.len();
        *table = CacheTable::default();
        tracing::info!(count = count, "Cleared dedup cache");
        count
    }

    /// Drop TTL-expired entries
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Drop entries expired as of `now`
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut table = self.inner.table.write().await;
        let count = self.sweep_locked(&mut table, now);
        if count > 0 {
            tracing::info!(count = count, "Swept expired dedup cache entries");
        }
        count
    }

    fn sweep_locked(&self, table: &mut CacheTable, now: DateTime<Utc>) -> usize {
        let expired = table.expired_digests(now);
        for digest in &expired {
            table.remove(digest);
        }
        self.inner
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Check presence without recording an access
    pub async fn contains(&self, digest: &str) -> bool {
        let table = self.inner.table.read().await;
        table.entries.contains_key(digest)
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let table = self.inner.table.read().await;
        CacheStats {
            entries: table.entries.len(),
            total_size: table.total_size,
            max_entries: self.inner.config.max_entries,
            max_size: self.inner.config.max_size,
            ttl_seconds: self.inner.config.ttl.num_seconds(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            expirations: self.inner.expirations.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Cache Statistics
// ============================================================================

/// Statistics about the dedup cache
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub max_entries: usize,
    pub max_size: u64,
    pub ttl_seconds: i64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

// ============================================================================
// Tests
// ============================================================================
