//! Content-addressed phrase cache
//!
//! Synthesised PCM is stored as `<sha256(text)>.pcm` under one directory whose
//! total size is capped. Recency survives restarts: the index is rebuilt from
//! file modification times, and every hit touches the file. The cache is an
//! optimisation only; unreadable or missing entries are misses, never errors.

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

const ENTRY_EXT: &str = "pcm";
const TEMP_EXT: &str = "tmp";

/// Counters and sizes reported by [`PhraseCache::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries, {} / {} bytes, {} hits, {} misses, {} evictions",
            self.entries, self.total_bytes, self.max_bytes, self.hits, self.misses, self.evictions
        )
    }
}

/// Size-bounded on-disk LRU of synthesised phrases
///
/// Owned by a single thread; all mutations go through `&mut self`.
pub struct PhraseCache {
    dir: PathBuf,
    max_bytes: u64,
    /// Key to entry size, least recently used first
    index: LruCache<String, u64>,
    total_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl PhraseCache {
    /// Open (creating if needed) the cache in `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or listed
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        let unusable = |e: std::io::Error| Error::Cache(format!("{}: {e}", dir.display()));
        fs::create_dir_all(&dir).map_err(unusable)?;

        let mut entries: Vec<(SystemTime, String, u64)> = Vec::new();
        for entry in fs::read_dir(&dir).map_err(unusable)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());

            if ext == Some(TEMP_EXT) {
                let _ = fs::remove_file(&path);
                continue;
            }
            if ext != Some(ENTRY_EXT) {
                continue;
            }
            let (Some(key), Ok(meta)) = (
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string),
                entry.metadata(),
            ) else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((modified, key, meta.len()));
        }
        entries.sort();

        let mut cache = Self {
            dir,
            max_bytes,
            index: LruCache::unbounded(),
            total_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        };
        for (_, key, size) in entries {
            cache.total_bytes += size;
            cache.index.put(key, size);
        }
        cache.evict_to_fit();

        tracing::info!(
            dir = %cache.dir.display(),
            entries = cache.index.len(),
            bytes = cache.total_bytes,
            max_bytes,
            "phrase cache opened"
        );
        Ok(cache)
    }

    /// Content hash used as the entry name
    #[must_use]
    pub fn key(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ENTRY_EXT}"))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether `text` has an entry, without touching its recency
    #[must_use]
    pub fn contains(&self, text: &str) -> bool {
        self.index.contains(&Self::key(text))
    }

    /// Fetch the PCM stored for `text`, marking it most recently used
    pub fn lookup(&mut self, text: &str) -> Option<Vec<u8>> {
        let key = Self::key(text);
        if self.index.get(&key).is_none() {
            self.misses += 1;
            return None;
        }

        let path = self.entry_path(&key);
        match fs::read(&path) {
            Ok(pcm) => {
                // Persist recency for the next start-up
                if let Err(e) = File::options()
                    .write(true)
                    .open(&path)
                    .and_then(|f| f.set_modified(SystemTime::now()))
                {
                    tracing::debug!(error = %e, "failed to touch cache entry");
                }
                self.hits += 1;
                tracing::debug!(key = %&key[..12], bytes = pcm.len(), "cache hit");
                Some(pcm)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "dropping unreadable cache entry"
                );
                self.forget(&key);
                self.misses += 1;
                None
            }
        }
    }

    /// Store PCM for `text`, evicting least recently used entries to fit
    ///
    /// Entries larger than the whole ceiling are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the entry cannot be written
    pub fn store(&mut self, text: &str, pcm: &[u8]) -> Result<()> {
        let size = pcm.len() as u64;
        if pcm.is_empty() || size > self.max_bytes {
            tracing::debug!(bytes = size, max = self.max_bytes, "not caching entry");
            return Ok(());
        }

        let key = Self::key(text);
        let path = self.entry_path(&key);
        let temp = path.with_extension(TEMP_EXT);

        if let Err(e) = fs::write(&temp, pcm).and_then(|()| fs::rename(&temp, &path)) {
            let _ = fs::remove_file(&temp);
            return Err(Error::Cache(format!("storing {}: {e}", path.display())));
        }

        if let Some(old) = self.index.put(key, size) {
            self.total_bytes -= old;
        }
        self.total_bytes += size;
        self.evict_to_fit();

        tracing::debug!(bytes = size, total = self.total_bytes, "cached phrase");
        Ok(())
    }

    /// Remove every entry
    ///
    /// # Errors
    ///
    /// Returns error if an entry file cannot be removed
    pub fn clear(&mut self) -> Result<()> {
        while let Some((key, _)) = self.index.pop_lru() {
            match fs::remove_file(self.entry_path(&key)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Cache(format!("clearing {}: {e}", self.dir.display()))),
            }
        }
        self.total_bytes = 0;
        tracing::info!(dir = %self.dir.display(), "phrase cache cleared");
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.index.len(),
            total_bytes: self.total_bytes,
            max_bytes: self.max_bytes,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    fn forget(&mut self, key: &str) {
        if let Some(size) = self.index.pop(key) {
            self.total_bytes -= size;
        }
    }

    fn evict_to_fit(&mut self) {
        while self.total_bytes > self.max_bytes {
            let Some((key, size)) = self.index.pop_lru() else {
                break;
            };
            self.total_bytes -= size;
            self.evictions += 1;
            if let Err(e) = fs::remove_file(self.entry_path(&key)) {
                tracing::debug!(error = %e, "evicted entry already gone");
            }
            tracing::debug!(
                bytes = size,
                total = self.total_bytes,
                "evicted cache entry"
            );
        }
    }
}
