//! On-disk kernel cache store
//!
//! Layout: `manifest.json` describing every entry, plus `blobs/<hex>` raw
//! payloads named by sha256(key ∥ version). The manifest schema version is
//! the first field; readers refuse unknown versions and skip unreadable
//! files instead of failing the whole load.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::cache::CachedKernel;
use super::{ArtifactPayload, Fingerprint, KernelArtifact, ParamLayout};
use crate::error::Result;

const MANIFEST_SCHEMA_VERSION: u32 = 1;
const BLOB_FORMAT_VERSION: u32 = 1;
const MANIFEST_NAME: &str = "manifest.json";
const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    /// Must stay the first field so mismatched readers can bail early
    schema_version: u32,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    /// Hex fingerprint of the cache key
    key: String,
    version: String,
    size: u64,
    created_unix: u64,
    ttl_secs: Option<u64>,
    metadata: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct ArtifactBlob {
    format_version: u32,
    entry_point: String,
    /// 0 = PTX, 1 = SPIR-V
    payload_kind: u8,
    payload: Vec<u8>,
    layout: ParamLayout,
}

/// Directory-backed store for compiled kernel artifacts
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn blob_name(key: &Fingerprint, version: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.0);
        hasher.update(version.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Load every decodable, unexpired entry. Unknown manifest schemas and
    /// corrupt files are skipped with a log line, never an error.
    pub fn load(&self, ttl: Option<Duration>) -> Result<Vec<(Fingerprint, CachedKernel)>> {
        let manifest_path = self.dir.join(MANIFEST_NAME);
        let raw = match fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(_) => {
                debug!("no cache manifest at {:?}", manifest_path);
                return Ok(Vec::new());
            }
        };
        let manifest: Manifest = match serde_json::from_str(&raw) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("ignoring unreadable cache manifest: {}", e);
                return Ok(Vec::new());
            }
        };
        if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            warn!(
                "refusing cache manifest schema {} (expected {})",
                manifest.schema_version, MANIFEST_SCHEMA_VERSION
            );
            return Ok(Vec::new());
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut restored = Vec::new();
        for entry in manifest.entries {
            let key = match parse_fingerprint(&entry.key) {
                Some(key) => key,
                None => {
                    warn!("skipping cache entry with malformed key {}", entry.key);
                    continue;
                }
            };
            let age = Duration::from_secs(now.saturating_sub(entry.created_unix));
            if let Some(ttl) = ttl {
                if age >= ttl {
                    debug!("skipping expired cache entry {}", entry.key);
                    continue;
                }
            }

            let blob_path = self
                .dir
                .join(BLOBS_DIR)
                .join(Self::blob_name(&key, &entry.version));
            let blob_bytes = match fs::read(&blob_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("skipping cache entry {}: blob unreadable ({})", entry.key, e);
                    continue;
                }
            };
            let blob: ArtifactBlob = match bincode::deserialize(&blob_bytes) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!("skipping cache entry {}: blob corrupt ({})", entry.key, e);
                    continue;
                }
            };
            if blob.format_version != BLOB_FORMAT_VERSION {
                warn!(
                    "skipping cache entry {}: blob format {} unknown",
                    entry.key, blob.format_version
                );
                continue;
            }

            let artifact = match blob.payload_kind {
                0 => KernelArtifact::ptx(blob.entry_point, blob.payload, blob.layout),
                1 => KernelArtifact::spirv(blob.entry_point, blob.payload, blob.layout),
                other => {
                    warn!(
                        "skipping cache entry {}: payload kind {} unknown",
                        entry.key, other
                    );
                    continue;
                }
            };

            restored.push((
                key,
                CachedKernel::restored(Arc::new(artifact), entry.version, entry.metadata, age),
            ));
        }
        info!("loaded {} kernel blobs from {:?}", restored.len(), self.dir);
        Ok(restored)
    }

    /// Persist a snapshot. Host-function artifacts have no serializable
    /// payload and are skipped. The manifest is written last, via rename,
    /// so readers never observe a half-written index.
    pub fn save(&self, snapshot: &[(Fingerprint, CachedKernel)]) -> Result<usize> {
        let blobs_dir = self.dir.join(BLOBS_DIR);
        fs::create_dir_all(&blobs_dir)?;

        let mut entries = Vec::new();
        for (key, kernel) in snapshot {
            let artifact = kernel.artifact();
            let (payload_kind, payload) = match artifact.payload() {
                ArtifactPayload::Ptx(bytes) => (0u8, bytes.clone()),
                ArtifactPayload::SpirV(bytes) => (1u8, bytes.clone()),
                ArtifactPayload::HostFn(_) => {
                    debug!(
                        "not persisting host-function kernel '{}'",
                        artifact.entry_point()
                    );
                    continue;
                }
            };

            let blob = ArtifactBlob {
                format_version: BLOB_FORMAT_VERSION,
                entry_point: artifact.entry_point().to_string(),
                payload_kind,
                payload,
                layout: artifact.layout().clone(),
            };
            let blob_bytes = bincode::serialize(&blob).map_err(|e| {
                crate::error::Error::InternalInvariantViolated(format!(
                    "artifact blob serialization failed: {}",
                    e
                ))
            })?;
            let size = blob_bytes.len() as u64;
            fs::write(blobs_dir.join(Self::blob_name(key, kernel.version())), blob_bytes)?;

            let created_unix = kernel
                .created_wall()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            entries.push(ManifestEntry {
                key: key.to_hex(),
                version: kernel.version().to_string(),
                size,
                created_unix,
                ttl_secs: None,
                metadata: kernel.metadata().clone(),
            });
        }

        let written = entries.len();
        let manifest = Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            entries,
        };
        let tmp = self.dir.join(format!("{}.tmp", MANIFEST_NAME));
        fs::write(&tmp, serde_json::to_vec_pretty(&manifest).map_err(|e| {
            crate::error::Error::InternalInvariantViolated(format!(
                "manifest serialization failed: {}",
                e
            ))
        })?)?;
        fs::rename(&tmp, self.dir.join(MANIFEST_NAME))?;
        info!("persisted {} kernel blobs to {:?}", written, self.dir);
        Ok(written)
    }
}

fn parse_fingerprint(hex_str: &str) -> Option<Fingerprint> {
    let bytes = hex::decode(hex_str).ok()?;
    let array: [u8; 32] = bytes.try_into().ok()?;
    Some(Fingerprint(array))
}
