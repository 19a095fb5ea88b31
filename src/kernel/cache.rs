//! Versioned kernel cache with TTL and LRU eviction
//!
//! Lookups hit only when the key is present, the version matches, and the
//! entry has not expired (the TTL interval is half-open: an entry whose age
//! equals the TTL is already expired). The eviction sweep runs at put time
//! once occupancy crosses the configured threshold fraction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use tracing::{debug, info};

use super::persist::CacheStore;
use super::{Fingerprint, KernelArtifact};
use crate::config::CacheConfig;
use crate::error::Result;

/// One cached compiled kernel
///
/// The version string is immutable for the entry's lifetime; a lookup with
/// any other version is a miss.
#[derive(Clone)]
pub struct CachedKernel {
    artifact: Arc<KernelArtifact>,
    version: String,
    created_at: Instant,
    created_wall: SystemTime,
    metadata: HashMap<String, String>,
}

impl CachedKernel {
    fn new(
        artifact: Arc<KernelArtifact>,
        version: String,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            artifact,
            version,
            created_at: Instant::now(),
            created_wall: SystemTime::now(),
            metadata,
        }
    }

    pub(crate) fn restored(
        artifact: Arc<KernelArtifact>,
        version: String,
        metadata: HashMap<String, String>,
        age: Duration,
    ) -> Self {
        // Instant cannot always represent times before process start; an
        // entry older than that is simply treated as freshly created.
        let created_at = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
        Self {
            artifact,
            version,
            created_at,
            created_wall: SystemTime::now() - age,
            metadata,
        }
    }

    pub fn artifact(&self) -> &Arc<KernelArtifact> {
        &self.artifact
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn created_wall(&self) -> SystemTime {
        self.created_wall
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Half-open expiry: age == ttl is already expired
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.created_at.elapsed() >= ttl,
            None => false,
        }
    }
}

struct CacheEntry {
    kernel: CachedKernel,
    last_access: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn touch(&mut self) {
        self.last_access = Instant::now();
        self.access_count += 1;
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expired_removals: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct StatCells {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expired_removals: AtomicU64,
}

/// Accelerator-scoped kernel cache
pub struct KernelCache {
    entries: DashMap<Fingerprint, CacheEntry>,
    config: CacheConfig,
    stats: StatCells,
    store: Option<Arc<CacheStore>>,
}

impl KernelCache {
    pub fn new(config: CacheConfig) -> Self {
        let store = if config.persistent {
            config
                .directory
                .as_ref()
                .map(|dir| Arc::new(CacheStore::new(dir.clone())))
        } else {
            None
        };
        Self {
            entries: DashMap::new(),
            config,
            stats: StatCells::default(),
            store,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    /// Hit iff present, version equal, and not expired
    pub fn try_get(&self, key: &Fingerprint, version: &str) -> Option<CachedKernel> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.kernel.is_expired(self.config.default_ttl) {
                    drop(entry);
                    self.entries.remove(key);
                    self.stats.expired_removals.fetch_add(1, Ordering::Relaxed);
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    None
                } else if entry.kernel.version() != version {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    None
                } else {
                    entry.touch();
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Some(entry.kernel.clone())
                }
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace. When occupancy has reached the eviction
    /// threshold, expired entries go first, then ascending
    /// (last_access, access_count) order until occupancy drops below it.
    pub fn put(
        &self,
        key: Fingerprint,
        artifact: KernelArtifact,
        version: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> CachedKernel {
        self.sweep_if_needed();

        let kernel = CachedKernel::new(Arc::new(artifact), version.into(), metadata);
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                kernel: kernel.clone(),
                last_access: now,
                access_count: 0,
            },
        );
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        kernel
    }

    fn occupancy(&self) -> f64 {
        self.entries.len() as f64 / self.config.max_size as f64
    }

    fn sweep_if_needed(&self) {
        if self.occupancy() < self.config.eviction_threshold {
            return;
        }

        // pass 1: expired entries
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|e| e.kernel.is_expired(self.config.default_ttl))
            .map(|e| *e.key())
            .collect();
        for key in expired {
            if self.entries.remove(&key).is_some() {
                self.stats.expired_removals.fetch_add(1, Ordering::Relaxed);
            }
        }

        // pass 2: LRU, ties broken by access count
        if self.occupancy() >= self.config.eviction_threshold {
            let mut candidates: Vec<(Fingerprint, Instant, u64)> = self
                .entries
                .iter()
                .map(|e| (*e.key(), e.last_access, e.access_count))
                .collect();
            candidates.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

            for (key, ..) in candidates {
                if self.occupancy() < self.config.eviction_threshold {
                    break;
                }
                if self.entries.remove(&key).is_some() {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("evicted cached kernel {:?}", key);
                }
            }
        }
    }

    /// Drop every entry carrying the given version
    pub fn invalidate_version(&self, version: &str) -> usize {
        let keys: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|e| e.kernel.version() == version)
            .map(|e| *e.key())
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("invalidated {} kernels at version {}", removed, version);
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            insertions: self.stats.insertions.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expired_removals: self.stats.expired_removals.load(Ordering::Relaxed),
        }
    }

    /// Load persisted entries, ignoring anything unreadable. No-op unless
    /// persistence is configured. Idempotent.
    pub fn preload(&self) -> Result<usize> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return Ok(0),
        };
        let restored = store.load(self.config.default_ttl)?;
        let mut loaded = 0;
        for (key, kernel) in restored {
            if self.entries.contains_key(&key) {
                continue;
            }
            if self.entries.len() >= self.config.max_size {
                break;
            }
            self.entries.insert(
                key,
                CacheEntry {
                    kernel,
                    last_access: Instant::now(),
                    access_count: 0,
                },
            );
            loaded += 1;
        }
        info!("preloaded {} cached kernels", loaded);
        Ok(loaded)
    }

    /// Write a consistent point-in-time snapshot to disk. No-op unless
    /// persistence is configured. Idempotent.
    pub fn persist(&self) -> Result<usize> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return Ok(0),
        };
        let snapshot: Vec<(Fingerprint, CachedKernel)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.kernel.clone()))
            .collect();
        store.save(&snapshot)
    }

    pub async fn preload_async(self: &Arc<Self>) -> Result<usize> {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.preload())
            .await
            .map_err(|e| {
                crate::error::Error::InternalInvariantViolated(format!(
                    "preload task failed: {}",
                    e
                ))
            })?
    }

    pub async fn persist_async(self: &Arc<Self>) -> Result<usize> {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.persist())
            .await
            .map_err(|e| {
                crate::error::Error::InternalInvariantViolated(format!(
                    "persist task failed: {}",
                    e
                ))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ParamLayout;

    fn artifact(name: &str) -> KernelArtifact {
        KernelArtifact::ptx(name, vec![0x2e, 0x70, 0x74, 0x78], ParamLayout::default())
    }

    fn cache(max_size: usize, threshold: f64, ttl: Option<Duration>) -> KernelCache {
        KernelCache::new(CacheConfig {
            max_size,
            default_ttl: ttl,
            eviction_threshold: threshold,
            persistent: false,
            directory: None,
        })
    }

    fn key(name: &str, version: &str) -> Fingerprint {
        crate::kernel::KernelSignature::new(name, crate::device::BackendKind::Cpu)
            .fingerprint(version)
    }

    #[test]
    fn hit_miss_and_version_invalidate() {
        let cache = cache(16, 0.9, None);
        let k = key("k", "1.0.0");

        cache.put(k, artifact("k"), "1.0.0", HashMap::new());
        assert!(cache.try_get(&k, "1.0.0").is_some());
        assert!(cache.try_get(&k, "2.0.0").is_none());

        assert_eq!(cache.invalidate_version("1.0.0"), 1);
        assert!(cache.try_get(&k, "1.0.0").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn version_mismatch_never_hits_even_when_fresh() {
        let cache = cache(16, 0.9, None);
        let k = key("saxpy", "1");
        cache.put(k, artifact("saxpy"), "1", HashMap::new());
        for _ in 0..3 {
            assert!(cache.try_get(&k, "2").is_none());
        }
        // the v1 entry survived the v2 misses
        assert!(cache.try_get(&k, "1").is_some());
    }

    #[test]
    fn lru_eviction_prefers_stale_entries() {
        let cache = cache(3, 0.8, None);
        let (k1, k2, k3, k4) = (key("k1", "1"), key("k2", "1"), key("k3", "1"), key("k4", "1"));

        cache.put(k1, artifact("k1"), "1", HashMap::new());
        cache.put(k2, artifact("k2"), "1", HashMap::new());
        assert!(cache.try_get(&k1, "1").is_some()); // refresh k1
        cache.put(k3, artifact("k3"), "1", HashMap::new());
        cache.put(k4, artifact("k4"), "1", HashMap::new());

        assert!(cache.try_get(&k1, "1").is_some());
        assert!(cache.try_get(&k3, "1").is_some());
        assert!(cache.try_get(&k4, "1").is_some());
        assert_eq!(cache.stats().evictions, 1);

        // k2 was the least recently used entry
        assert!(cache.try_get(&k2, "1").is_none());
    }

    #[test]
    fn size_never_exceeds_max() {
        let cache = cache(4, 1.0, None);
        for i in 0..64 {
            let name = format!("k{}", i);
            cache.put(key(&name, "1"), artifact(&name), "1", HashMap::new());
            assert!(cache.len() <= 4);
        }
    }

    #[test]
    fn threshold_sweep_runs_before_admission() {
        let cache = cache(10, 0.5, None);
        for i in 0..5 {
            let name = format!("k{}", i);
            cache.put(key(&name, "1"), artifact(&name), "1", HashMap::new());
        }
        // occupancy 0.5 == threshold: next put sweeps below threshold first
        cache.put(key("next", "1"), artifact("next"), "1", HashMap::new());
        assert!(cache.len() <= 5);
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn ttl_boundary_is_half_open() {
        let cache = cache(16, 0.9, Some(Duration::ZERO));
        let k = key("k", "1");
        cache.put(k, artifact("k"), "1", HashMap::new());
        // age >= ttl at the very instant of creation
        assert!(cache.try_get(&k, "1").is_none());
        assert_eq!(cache.stats().expired_removals, 1);
    }

    #[test]
    fn expired_entries_fall_to_the_ttl_pass_first() {
        let cache = cache(4, 0.5, Some(Duration::from_millis(20)));
        cache.put(key("old", "1"), artifact("old"), "1", HashMap::new());
        std::thread::sleep(Duration::from_millis(30));
        cache.put(key("new1", "1"), artifact("new1"), "1", HashMap::new());
        // occupancy 2/4 == 0.5 triggers the sweep: expired first, no LRU needed
        cache.put(key("new2", "1"), artifact("new2"), "1", HashMap::new());
        assert!(cache.try_get(&key("old", "1"), "1").is_none());
        assert!(cache.try_get(&key("new1", "1"), "1").is_some());
        let stats = cache.stats();
        assert!(stats.expired_removals >= 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn replacing_a_key_keeps_len_stable() {
        let cache = cache(16, 0.9, None);
        let k = key("k", "1");
        cache.put(k, artifact("k"), "1", HashMap::new());
        cache.put(k, artifact("k"), "2", HashMap::new());
        assert_eq!(cache.len(), 1);
        assert!(cache.try_get(&k, "1").is_none());
        assert!(cache.try_get(&k, "2").is_some());
    }
}
