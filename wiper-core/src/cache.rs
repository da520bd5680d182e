use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Pending insertions that trigger a rewrite of the store.
pub const DEFAULT_FLUSH_INTERVAL: usize = 100;

/// Last-known size and modification time of a path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pending: usize,
}

/// Persisted map from resolved path to [`CacheEntry`].
///
/// Writes are coalesced: the store is rewritten after every
/// `flush_interval` insertions, at the end of each scan and on drop. A crash
/// between flushes loses the pending entries.
#[derive(Debug)]
pub struct ScanCache {
    store: Option<PathBuf>,
    flush_interval: usize,
    state: Mutex<CacheState>,
}

impl ScanCache {
    /// Open the store at `path`. A missing or corrupt store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, CacheEntry>>(&content) {
                Ok(entries) => {
                    info!("Loaded {} scan cache entries from {:?}", entries.len(), path);
                    entries
                }
                Err(e) => {
                    warn!("Ignoring corrupt scan cache {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("Cannot read scan cache {:?}: {}", path, e);
                HashMap::new()
            }
        };

        Self {
            store: Some(path),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            state: Mutex::new(CacheState {
                entries,
                pending: 0,
            }),
        }
    }

    /// Cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            store: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            state: Mutex::default(),
        }
    }

    pub fn with_flush_interval(mut self, interval: usize) -> Self {
        self.flush_interval = interval.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(path: &Path) -> String {
        fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .to_string()
    }

    pub fn get(&self, path: &Path) -> Option<CacheEntry> {
        self.lock().entries.get(&Self::key(path)).copied()
    }

    pub fn set(&self, path: &Path, size: u64, modified: Option<SystemTime>) {
        let timestamp = modified
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0.0, |d| d.as_secs_f64());
        let key = Self::key(path);

        let should_flush = {
            let mut state = self.lock();
            state.entries.insert(key, CacheEntry { size, timestamp });
            state.pending += 1;
            state.pending >= self.flush_interval
        };

        if should_flush {
            if let Err(e) = self.flush() {
                warn!("Scan cache flush failed: {:#}", e);
            }
        }
    }

    pub fn remove(&self, path: &Path) -> Option<CacheEntry> {
        let mut state = self.lock();
        let removed = state.entries.remove(&Self::key(path));
        if removed.is_some() {
            state.pending += 1;
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.pending += 1;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_deref()
    }

    /// Rewrite the whole store if anything changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let Some(store) = &self.store else {
            self.lock().pending = 0;
            return Ok(());
        };

        let (content, flushed) = {
            let mut state = self.lock();
            if state.pending == 0 {
                return Ok(());
            }
            let content =
                serde_json::to_string(&state.entries).context("Failed to encode scan cache")?;
            (content, std::mem::take(&mut state.pending))
        };

        if let Err(e) = Self::write_store(store, &content) {
            self.lock().pending += flushed;
            return Err(e);
        }
        debug!("Flushed scan cache to {:?}", store);
        Ok(())
    }

    /// Replace `store` through a uniquely named file in the same directory.
    fn write_store(store: &Path, content: &str) -> Result<()> {
        let parent = match store.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache directory {parent:?}"))?;

        let mut staging = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to stage scan cache in {parent:?}"))?;
        staging
            .write_all(content.as_bytes())
            .with_context(|| format!("Failed to write scan cache {:?}", staging.path()))?;
        staging
            .persist(store)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace scan cache {store:?}"))?;
        Ok(())
    }
}

impl Drop for ScanCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Scan cache flush on drop failed: {:#}", e);
        }
    }
}
