//! On-disk cache of image descriptions.
//!
//! Entries live in one JSON index (`descriptions.json`) under the cache
//! directory, keyed by the SHA-256 of the image path and its surrounding
//! text.  A re-run over the same document skips the vision API for every
//! image it has already described.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{DescribeError, ImageDescriber, ImageDescription};

pub const CACHE_FILE: &str = "descriptions.json";

const SECS_PER_DAY: u64 = 86_400;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialise cache: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub image: String,
    pub description: ImageDescription,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// DescriptionCache
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DescriptionCache {
    file: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl DescriptionCache {
    /// Load the index from `dir`, creating the directory if needed.  A
    /// missing index starts empty; so does an unreadable one, with a warning.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join(CACHE_FILE);
        let entries = match std::fs::read(&file) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                log::warn!("describe: ignoring corrupt cache {}: {e}", file.display());
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        log::debug!("describe: {} cached descriptions in {}", entries.len(), file.display());
        Ok(Self {
            file,
            entries: Mutex::new(entries),
        })
    }

    pub fn key(path: &Path, context: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(context.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, path: &Path, context: &str) -> Option<ImageDescription> {
        self.lock()
            .get(&Self::key(path, context))
            .map(|entry| entry.description.clone())
    }

    /// Store `description` and rewrite the index.
    pub fn insert(
        &self,
        path: &Path,
        context: &str,
        description: ImageDescription,
    ) -> Result<(), CacheError> {
        let mut entries = self.lock();
        entries.insert(
            Self::key(path, context),
            CacheEntry {
                image: path.display().to_string(),
                description,
                created_at: unix_now(),
            },
        );
        self.persist(&entries)
    }

    /// Drop entries older than `max_age_days`; returns how many went.
    pub fn clear_old_entries(&self, max_age_days: u64) -> Result<usize, CacheError> {
        self.prune(max_age_days.saturating_mul(SECS_PER_DAY), unix_now())
    }

    fn prune(&self, max_age_secs: u64, now: u64) -> Result<usize, CacheError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_sub(entry.created_at) <= max_age_secs);
        let removed = before - entries.len();
        if removed > 0 {
            log::info!("describe: pruned {removed} cached descriptions");
            self.persist(&entries)?;
        }
        Ok(removed)
    }

    /// Write to a sibling temp file, then rename over the index.
    fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), CacheError> {
        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

// ---------------------------------------------------------------------------
// CachedDescriber
// ---------------------------------------------------------------------------

/// Answers from the cache when it can and stores every fresh description.
pub struct CachedDescriber {
    inner: Arc<dyn ImageDescriber>,
    cache: Arc<DescriptionCache>,
}

impl CachedDescriber {
    pub fn new(inner: Arc<dyn ImageDescriber>, cache: Arc<DescriptionCache>) -> Self {
        Self { inner, cache }
    }
}

impl ImageDescriber for CachedDescriber {
    fn describe(&self, path: &Path, context: &str) -> Result<ImageDescription, DescribeError> {
        if let Some(hit) = self.cache.get(path, context) {
            log::debug!("describe: cache hit for {}", path.display());
            return Ok(hit);
        }
        let description = self.inner.describe(path, context)?;
        if let Err(e) = self.cache.insert(path, context, description.clone()) {
            log::warn!("describe: could not cache {}: {e}", path.display());
        }
        Ok(description)
    }
}
