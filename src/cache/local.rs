use std::fs;
use std::io::{BufReader, ErrorKind};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, CacheTier, OutputBundle};
use crate::error::CacheError;
use crate::lock::{FileLock, LockMode, write_atomic};

const ENTRY_VERSION: u32 = 1;
const LOCK_FILE: &str = "cache.lock";
const ENTRY_EXT: &str = "cbor";

/// Limits applied by [`LocalCache::evict`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRetention {
    /// Entries created longer ago than this are removed.
    pub max_age: Option<Duration>,
    /// After age based eviction, the oldest entries are removed until the
    /// total size of the cache fits.
    pub max_size: Option<u64>,
}

/// What a call to [`LocalCache::evict`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub removed: usize,
    pub freed: u64,
    pub kept: usize,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    version: u32,
    key: CacheKey,
    bundle: OutputBundle,
}

/// A build cache tier backed by a directory on the local disk.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: Utf8PathBuf,
}

impl LocalCache {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> Utf8PathBuf {
        self.root.join(key.to_hex()).with_extension(ENTRY_EXT)
    }

    fn lock(&self, mode: LockMode) -> Result<FileLock, CacheError> {
        FileLock::acquire(&self.root.join(LOCK_FILE), mode)
            .map_err(|(path, source)| CacheError::Lock { path, source })
    }

    /// Removes entries according to `retention`.
    pub fn evict(&self, retention: &CacheRetention) -> Result<EvictionStats, CacheError> {
        let _guard = self.lock(LockMode::Exclusive)?;

        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Ok(path) = Utf8PathBuf::try_from(entry.path()) else {
                continue;
            };
            if path.extension() != Some(ENTRY_EXT) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let created = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((path, created, meta.len()));
        }

        // oldest first
        entries.sort_by_key(|(_, created, _)| *created);

        let now = SystemTime::now();
        let mut stats = EvictionStats::default();
        let mut total: u64 = entries.iter().map(|(_, _, size)| size).sum();

        for (path, created, size) in entries {
            let expired = retention
                .max_age
                .is_some_and(|max| now.duration_since(created).unwrap_or_default() > max);
            let oversize = retention.max_size.is_some_and(|max| total > max);

            if expired || oversize {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        stats.removed += 1;
                        stats.freed += size;
                    }
                    // already evicted by another process
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!("couldn't evict cache entry {path}: {e}");
                        stats.kept += 1;
                        continue;
                    }
                }
                total -= size;
            } else {
                stats.kept += 1;
            }
        }

        tracing::debug!(
            removed = stats.removed,
            freed = stats.freed,
            kept = stats.kept,
            "evicted local cache entries"
        );

        Ok(stats)
    }
}

impl CacheTier for LocalCache {
    fn name(&self) -> &str {
        "local"
    }

    fn load(&self, key: &CacheKey) -> Result<Option<OutputBundle>, CacheError> {
        let _guard = self.lock(LockMode::Shared)?;

        let file = match fs::File::open(self.entry_path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredEntry = ciborium::from_reader(BufReader::new(file))
            .map_err(|e| CacheError::Decode(e.to_string()))?;

        if stored.version != ENTRY_VERSION || &stored.key != key {
            return Ok(None);
        }

        Ok(Some(stored.bundle))
    }

    fn store(&self, key: &CacheKey, bundle: &OutputBundle) -> Result<(), CacheError> {
        let stored = StoredEntry {
            version: ENTRY_VERSION,
            key: *key,
            bundle: bundle.clone(),
        };

        let mut buffer = Vec::new();
        ciborium::into_writer(&stored, &mut buffer)
            .map_err(|e| CacheError::Encode(e.to_string()))?;

        let _guard = self.lock(LockMode::Exclusive)?;
        write_atomic(&self.entry_path(key), &buffer)?;
        Ok(())
    }
}
