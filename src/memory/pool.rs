//! Per-accelerator buffer pool
//!
//! Pools rank-1 device buffers per element type. `rent` prefers the
//! smallest buffer that fits, most-recently-returned on ties, so hot
//! buffers stay cache-warm. Retention follows the configured policy;
//! maintenance runs on a periodic tick and on demand via `trim`.

use std::any::TypeId;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::buffer::{same_driver, BufferRegistry};
use super::{Element, MemoryBuffer, MemoryLocation, Shape};
use crate::config::{PoolConfig, RetentionPolicy};
use crate::driver::{DevicePtr, DriverBackend};
use crate::error::{Error, Result};

/// Adaptive retention: buffers younger than this are always held
const ADAPTIVE_MAX_AGE: Duration = Duration::from_secs(120);
/// Adaptive retention: a pool earning this hit ratio holds everything
const ADAPTIVE_MIN_HIT_RATIO: f64 = 0.7;

struct PooledEntry {
    ptr: DevicePtr,
    alloc_bytes: usize,
    /// Element count of the original allocation
    len: usize,
    returned_at: Instant,
}

#[derive(Default)]
struct Bucket {
    entries: Mutex<Vec<PooledEntry>>,
}

/// Pool usage counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Buffers resident in the pool
    pub total: usize,
    /// Buffers rented out and not yet returned
    pub in_use: usize,
    pub hits: u64,
    pub misses: u64,
    pub resident_bytes: u64,
}

impl PoolStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct PoolInner {
    driver: Arc<dyn DriverBackend>,
    owner: u64,
    config: PoolConfig,
    /// Accelerator-wide registry rented buffers join for teardown cascade
    registry: Arc<BufferRegistry>,
    buckets: DashMap<TypeId, Bucket>,
    hits: AtomicU64,
    misses: AtomicU64,
    in_use: AtomicUsize,
    resident_bytes: AtomicU64,
}

impl PoolInner {
    fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    fn free_entry(&self, entry: PooledEntry) {
        self.resident_bytes
            .fetch_sub(entry.alloc_bytes as u64, Ordering::AcqRel);
        if let Err(e) = self.driver.free(entry.ptr) {
            warn!("pool free failed: {}", e);
        }
    }

    /// Free pooled buffers (oldest first, across buckets) until `bytes`
    /// more fit under the residency cap.
    fn make_room(&self, bytes: usize) {
        while self.resident_bytes.load(Ordering::Acquire) + bytes as u64
            > self.config.max_pool_bytes
        {
            let mut oldest: Option<(TypeId, Instant)> = None;
            for bucket in self.buckets.iter() {
                let entries = bucket.entries.lock();
                if let Some(entry) = entries.iter().min_by_key(|e| e.returned_at) {
                    if oldest.map_or(true, |(_, t)| entry.returned_at < t) {
                        oldest = Some((*bucket.key(), entry.returned_at));
                    }
                }
            }
            let Some((type_id, stamp)) = oldest else { break };
            let Some(bucket) = self.buckets.get(&type_id) else { break };
            let mut entries = bucket.entries.lock();
            let Some(pos) = entries.iter().position(|e| e.returned_at == stamp) else {
                continue;
            };
            let entry = entries.remove(pos);
            drop(entries);
            trace!("pool residency eviction: {} bytes", entry.alloc_bytes);
            self.free_entry(entry);
        }
    }

    /// Apply the retention policy to every pooled buffer
    fn apply_retention(&self) {
        let hit_ratio = self.hit_ratio();
        let mut freed = 0usize;
        for bucket in self.buckets.iter() {
            let mut entries = bucket.entries.lock();
            let mut keep = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                let age = entry.returned_at.elapsed();
                let hold = match self.config.retention {
                    RetentionPolicy::Immediate => false,
                    RetentionPolicy::Fixed => age < self.config.trim_interval,
                    RetentionPolicy::Adaptive => {
                        age < ADAPTIVE_MAX_AGE || hit_ratio > ADAPTIVE_MIN_HIT_RATIO
                    }
                };
                if hold {
                    keep.push(entry);
                } else {
                    self.resident_bytes
                        .fetch_sub(entry.alloc_bytes as u64, Ordering::AcqRel);
                    if let Err(e) = self.driver.free(entry.ptr) {
                        warn!("pool free failed: {}", e);
                    }
                    freed += 1;
                }
            }
            *entries = keep;
        }
        if freed > 0 {
            debug!("pool trim freed {} buffers", freed);
        }
    }

    /// Free everything, ignoring retention; used at teardown
    fn drain(&self) {
        for bucket in self.buckets.iter() {
            let mut entries = bucket.entries.lock();
            for entry in entries.drain(..) {
                self.resident_bytes
                    .fetch_sub(entry.alloc_bytes as u64, Ordering::AcqRel);
                if let Err(e) = self.driver.free(entry.ptr) {
                    warn!("pool free failed: {}", e);
                }
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Per-accelerator, per-element-type buffer pool
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
    maintenance: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl BufferPool {
    pub(crate) fn new(
        driver: Arc<dyn DriverBackend>,
        owner: u64,
        config: PoolConfig,
        registry: Arc<BufferRegistry>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            driver,
            owner,
            config,
            registry,
            buckets: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            in_use: AtomicUsize::new(0),
            resident_bytes: AtomicU64::new(0),
        });

        // periodic maintenance tick, when a runtime is around to host it
        let maintenance = if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let tick_inner = Arc::downgrade(&inner);
            let interval = inner.config.trim_interval;
            Some(handle.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match tick_inner.upgrade() {
                        Some(inner) => inner.apply_retention(),
                        None => break,
                    }
                }
            }))
        } else {
            None
        };

        Self {
            inner,
            maintenance: Arc::new(Mutex::new(maintenance)),
        }
    }

    /// Rent a rank-1 buffer with at least `min_len` elements.
    ///
    /// The smallest pooled buffer that fits wins; on equal sizes the most
    /// recently returned one does. With no candidate a fresh allocation is
    /// made.
    pub fn rent<T: Element>(&self, min_len: usize) -> Result<MemoryBuffer<T>> {
        let elem_size = std::mem::size_of::<T>();
        let type_id = TypeId::of::<T>();

        if let Some(bucket) = self.inner.buckets.get(&type_id) {
            let mut entries = bucket.entries.lock();
            let best = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.len >= min_len)
                .min_by(|(_, a), (_, b)| {
                    a.len
                        .cmp(&b.len)
                        .then(b.returned_at.cmp(&a.returned_at))
                })
                .map(|(i, _)| i);
            if let Some(index) = best {
                let entry = entries.remove(index);
                drop(entries);
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                self.inner.in_use.fetch_add(1, Ordering::AcqRel);
                self.inner
                    .resident_bytes
                    .fetch_sub(entry.alloc_bytes as u64, Ordering::AcqRel);
                trace!("pool hit: {} elements", entry.len);
                return Ok(MemoryBuffer::from_alloc(
                    self.inner.driver.clone(),
                    entry.ptr,
                    entry.alloc_bytes,
                    Shape::D1(entry.len),
                    MemoryLocation::Device,
                    self.inner.owner,
                    &self.inner.registry,
                ));
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        let bytes = min_len * elem_size;
        let ptr = self.inner.driver.alloc(bytes)?;
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryBuffer::from_alloc(
            self.inner.driver.clone(),
            ptr,
            bytes,
            Shape::D1(min_len),
            MemoryLocation::Device,
            self.inner.owner,
            &self.inner.registry,
        ))
    }

    /// Return a rented buffer. A disposed buffer or one from a different
    /// accelerator is a fatal InvalidArgument.
    pub fn return_buffer<T: Element>(&self, buffer: MemoryBuffer<T>, clear: bool) -> Result<()> {
        if !same_driver(&buffer.raw().driver, &self.inner.driver)
            || buffer.owner_tag() != self.inner.owner
        {
            return Err(Error::InvalidArgument(
                "buffer belongs to a different accelerator".into(),
            ));
        }

        let len = buffer.len();
        let (ptr, alloc_bytes) = buffer.raw().surrender()?;
        self.inner.in_use.fetch_sub(1, Ordering::AcqRel);

        if clear {
            self.inner.driver.fill_zero(ptr, 0, alloc_bytes)?;
        }

        let oversized = alloc_bytes as u64 > self.inner.config.max_buffer_bytes;
        if oversized || self.inner.config.retention == RetentionPolicy::Immediate {
            self.inner
                .resident_bytes
                .fetch_add(alloc_bytes as u64, Ordering::AcqRel);
            self.inner.free_entry(PooledEntry {
                ptr,
                alloc_bytes,
                len,
                returned_at: Instant::now(),
            });
            return Ok(());
        }

        self.inner.make_room(alloc_bytes);
        if alloc_bytes as u64 > self.inner.config.max_pool_bytes {
            // cannot ever fit; free directly
            if let Err(e) = self.inner.driver.free(ptr) {
                warn!("pool free failed: {}", e);
            }
            return Ok(());
        }

        self.inner
            .resident_bytes
            .fetch_add(alloc_bytes as u64, Ordering::AcqRel);
        self.inner
            .buckets
            .entry(TypeId::of::<T>())
            .or_default()
            .entries
            .lock()
            .push(PooledEntry {
                ptr,
                alloc_bytes,
                len,
                returned_at: Instant::now(),
            });
        Ok(())
    }

    /// Release every pooled (unreferenced) buffer now. This is the
    /// memory-pressure path; the periodic tick applies the retention
    /// policy instead.
    pub fn trim(&self) {
        self.inner.drain();
    }

    /// Apply the retention policy once, as the maintenance tick does
    pub fn maintain(&self) {
        self.inner.apply_retention();
    }

    /// Free every pooled buffer regardless of policy
    pub fn drain(&self) {
        self.inner.drain();
    }

    pub fn stats(&self) -> PoolStats {
        let total = self
            .inner
            .buckets
            .iter()
            .map(|b| b.entries.lock().len())
            .sum();
        PoolStats {
            total,
            in_use: self.inner.in_use.load(Ordering::Acquire),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            resident_bytes: self.inner.resident_bytes.load(Ordering::Acquire),
        }
    }

    pub(crate) fn stop_maintenance(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.stop_maintenance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::CpuDriver;

    fn pool(retention: RetentionPolicy) -> BufferPool {
        BufferPool::new(
            Arc::new(CpuDriver::new(false)),
            1,
            PoolConfig {
                max_pool_bytes: 1024 * 1024,
                max_buffer_bytes: 64 * 1024,
                retention,
                trim_interval: Duration::from_millis(50),
            },
            Arc::new(BufferRegistry::default()),
        )
    }

    #[test]
    fn rent_return_rent_reuses_the_same_allocation() {
        let pool = pool(RetentionPolicy::Adaptive);

        let a = pool.rent::<i32>(1000).unwrap();
        let handle = a.native_handle().unwrap();
        pool.return_buffer(a, false).unwrap();

        let b = pool.rent::<i32>(1000).unwrap();
        assert_eq!(b.native_handle().unwrap(), handle);
        assert!(b.len() >= 1000);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.in_use, 1);
    }

    #[test]
    fn smallest_fit_wins_and_ties_break_most_recent() {
        let pool = pool(RetentionPolicy::Adaptive);

        let big = pool.rent::<f32>(4096).unwrap();
        let small_old = pool.rent::<f32>(512).unwrap();
        let small_new = pool.rent::<f32>(512).unwrap();
        let old_handle = small_old.native_handle().unwrap();
        let new_handle = small_new.native_handle().unwrap();
        assert_ne!(old_handle, new_handle);

        pool.return_buffer(big, false).unwrap();
        pool.return_buffer(small_old, false).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        pool.return_buffer(small_new, false).unwrap();

        // smallest candidate that fits, most recently returned on the tie
        let rented = pool.rent::<f32>(256).unwrap();
        assert_eq!(rented.native_handle().unwrap(), new_handle);
    }

    #[test]
    fn per_type_buckets_do_not_cross() {
        let pool = pool(RetentionPolicy::Adaptive);
        let ints = pool.rent::<i32>(64).unwrap();
        let int_handle = ints.native_handle().unwrap();
        pool.return_buffer(ints, false).unwrap();

        let floats = pool.rent::<f32>(64).unwrap();
        assert_ne!(floats.native_handle().unwrap(), int_handle);
        assert_eq!(pool.stats().misses, 2);
    }

    #[test]
    fn immediate_retention_holds_nothing() {
        let pool = pool(RetentionPolicy::Immediate);
        let buffer = pool.rent::<u8>(128).unwrap();
        pool.return_buffer(buffer, false).unwrap();
        assert_eq!(pool.stats().total, 0);

        let again = pool.rent::<u8>(128).unwrap();
        drop(again);
        assert_eq!(pool.stats().hits, 0);
    }

    #[test]
    fn returning_a_disposed_buffer_is_fatal() {
        let pool = pool(RetentionPolicy::Adaptive);
        let buffer = pool.rent::<u8>(16).unwrap();
        buffer.dispose().unwrap();
        let err = pool.return_buffer(buffer, false).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn returning_an_alien_buffer_is_fatal() {
        let pool_a = pool(RetentionPolicy::Adaptive);
        let pool_b = pool(RetentionPolicy::Adaptive);
        let buffer = pool_a.rent::<u8>(16).unwrap();
        let err = pool_b.return_buffer(buffer, false).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn cleared_returns_hand_back_zeroed_memory() {
        let pool = pool(RetentionPolicy::Adaptive);
        let buffer = pool.rent::<u32>(8).unwrap();
        buffer.copy_from_host(&[7u32; 8], None).unwrap();
        pool.return_buffer(buffer, true).unwrap();

        let again = pool.rent::<u32>(8).unwrap();
        let mut host = [1u32; 8];
        again.copy_to_host(&mut host).unwrap();
        assert_eq!(host, [0u32; 8]);
    }

    #[test]
    fn oversized_buffers_bypass_the_pool() {
        let pool = pool(RetentionPolicy::Adaptive);
        // 64 KiB cap: 32k f32 = 128 KiB
        let big = pool.rent::<f32>(32 * 1024).unwrap();
        pool.return_buffer(big, false).unwrap();
        assert_eq!(pool.stats().total, 0);
    }

    #[test]
    fn residency_cap_evicts_oldest_first() {
        let driver: Arc<dyn DriverBackend> = Arc::new(CpuDriver::new(false));
        let pool = BufferPool::new(
            driver,
            1,
            PoolConfig {
                max_pool_bytes: 3000,
                max_buffer_bytes: 2000,
                retention: RetentionPolicy::Adaptive,
                trim_interval: Duration::from_secs(60),
            },
            Arc::new(BufferRegistry::default()),
        );

        let first = pool.rent::<u8>(1500).unwrap();
        let first_handle = first.native_handle().unwrap();
        let second = pool.rent::<u8>(1500).unwrap();
        let third = pool.rent::<u8>(1500).unwrap();

        pool.return_buffer(first, false).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        pool.return_buffer(second, false).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        // 4500 bytes would exceed the cap: the oldest (first) must go
        pool.return_buffer(third, false).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert!(stats.resident_bytes <= 3000);

        // first's allocation is gone; renting cannot see its handle
        let a = pool.rent::<u8>(1500).unwrap();
        let b = pool.rent::<u8>(1500).unwrap();
        assert_ne!(a.native_handle().unwrap(), first_handle);
        assert_ne!(b.native_handle().unwrap(), first_handle);
    }

    #[test]
    fn trim_respects_fixed_retention_age() {
        let driver: Arc<dyn DriverBackend> = Arc::new(CpuDriver::new(false));
        let pool = BufferPool::new(
            driver,
            1,
            PoolConfig {
                max_pool_bytes: 1024 * 1024,
                max_buffer_bytes: 64 * 1024,
                retention: RetentionPolicy::Fixed,
                trim_interval: Duration::from_millis(10),
            },
            Arc::new(BufferRegistry::default()),
        );
        let buffer = pool.rent::<u8>(64).unwrap();
        pool.return_buffer(buffer, false).unwrap();
        assert_eq!(pool.stats().total, 1);

        std::thread::sleep(Duration::from_millis(20));
        pool.maintain();
        assert_eq!(pool.stats().total, 0);
    }

    #[test]
    fn adaptive_retention_holds_young_buffers_on_maintenance() {
        let pool = pool(RetentionPolicy::Adaptive);
        let buffer = pool.rent::<u8>(64).unwrap();
        pool.return_buffer(buffer, false).unwrap();

        pool.maintain();
        assert_eq!(pool.stats().total, 1);

        // explicit trim is the memory-pressure path and ignores retention
        pool.trim();
        assert_eq!(pool.stats().total, 0);
    }
}
