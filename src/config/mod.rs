//! Runtime configuration
//!
//! The option set is closed: everything tunable lives here, with validated
//! defaults. No environment variables and no CLI surface.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, RetryConfig};

/// Discovery ordering bias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreferredBackend {
    #[default]
    Auto,
    Cuda,
    OpenCl,
    Cpu,
}

/// What the pool does with returned buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Return frees to the driver immediately; the pool holds nothing
    Immediate,
    /// Hold for the configured interval, free on the next maintenance tick
    Fixed,
    /// Hold while young or while the pool is earning its keep
    #[default]
    Adaptive,
}

/// Optimization profile forwarded to kernel compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    #[default]
    Default,
    Speed,
    Size,
    Debug,
}

/// Memory pool tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on pooled residency, in bytes
    pub max_pool_bytes: u64,
    /// Buffers above this size bypass the pool entirely
    pub max_buffer_bytes: u64,
    pub retention: RetentionPolicy,
    /// Hold interval for the Fixed policy and the maintenance tick period
    #[serde(with = "humantime_serde")]
    pub trim_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_bytes: 256 * 1024 * 1024,
            max_buffer_bytes: 64 * 1024 * 1024,
            retention: RetentionPolicy::Adaptive,
            trim_interval: Duration::from_secs(30),
        }
    }
}

/// Kernel cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Max number of cached kernels
    pub max_size: usize,
    /// Entries older than this are expired; None disables expiry
    #[serde(default, with = "humantime_serde")]
    pub default_ttl: Option<Duration>,
    /// Fraction of max_size that triggers the eviction sweep, in (0, 1]
    pub eviction_threshold: f64,
    /// Enable the on-disk cache; requires `directory`
    pub persistent: bool,
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 512,
            default_ttl: Some(Duration::from_secs(3600)),
            eviction_threshold: 0.9,
            persistent: false,
            directory: None,
        }
    }
}

/// Kernel compilation options forwarded to backends
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KernelConfig {
    pub optimization: OptimizationLevel,
}

/// Hybrid CPU/GPU dispatch tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    /// Element count below which the CPU-SIMD path is chosen outright
    pub small_threshold: usize,
    /// CPU share of the outermost dimension under the Hybrid strategy
    pub cpu_gpu_ratio: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            small_threshold: 4096,
            cpu_gpu_ratio: 0.3,
        }
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub preferred_backend: PreferredBackend,
    pub enable_memory_pool: bool,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub kernel: KernelConfig,
    pub hybrid: HybridConfig,
    /// Max wait for stream drain at accelerator/context teardown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            preferred_backend: PreferredBackend::Auto,
            enable_memory_pool: true,
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            kernel: KernelConfig::default(),
            hybrid: HybridConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Validate cross-field constraints. Invalid configuration is an
    /// `Unsupported` error, never a panic.
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_size == 0 {
            return Err(Error::Unsupported("cache.max_size must be at least 1".into()));
        }
        if !(self.cache.eviction_threshold > 0.0 && self.cache.eviction_threshold <= 1.0) {
            return Err(Error::Unsupported(format!(
                "cache.eviction_threshold must lie in (0, 1], got {}",
                self.cache.eviction_threshold
            )));
        }
        if self.cache.persistent && self.cache.directory.is_none() {
            return Err(Error::Unsupported(
                "cache.persistent requires cache.directory".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hybrid.cpu_gpu_ratio) {
            return Err(Error::Unsupported(format!(
                "hybrid.cpu_gpu_ratio must lie in [0, 1], got {}",
                self.hybrid.cpu_gpu_ratio
            )));
        }
        if self.pool.max_buffer_bytes > self.pool.max_pool_bytes {
            return Err(Error::Unsupported(
                "pool.max_buffer_bytes exceeds pool.max_pool_bytes".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn persistent_cache_requires_directory() {
        let mut config = RuntimeConfig::default();
        config.cache.persistent = true;
        assert!(matches!(config.validate(), Err(Error::Unsupported(_))));

        config.cache.directory = Some(PathBuf::from("/tmp/ignis-cache"));
        config.validate().unwrap();
    }

    #[test]
    fn eviction_threshold_bounds_checked() {
        let mut config = RuntimeConfig::default();
        config.cache.eviction_threshold = 0.0;
        assert!(config.validate().is_err());
        config.cache.eviction_threshold = 1.0;
        assert!(config.validate().is_ok());
        config.cache.eviction_threshold = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn hybrid_ratio_bounds_checked() {
        let mut config = RuntimeConfig::default();
        config.hybrid.cpu_gpu_ratio = -0.1;
        assert!(config.validate().is_err());
        config.hybrid.cpu_gpu_ratio = 0.7;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache.max_size, config.cache.max_size);
        assert_eq!(back.shutdown_timeout, config.shutdown_timeout);
        assert_eq!(back.pool.retention, config.pool.retention);
    }
}
