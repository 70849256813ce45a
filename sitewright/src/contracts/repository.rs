//! The metadata cache contract and its built-in backings.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::errors::CacheError;

/// Addresses one metadata record.
///
/// Records are scoped to the artifact and chain position that wrote them, so
/// two stages never collide even when they pick the same key string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetadataKey {
    /// The owning entry's name or target pattern.
    pub artifact: String,
    /// The writing stage's position, 0 at the chain root.
    pub position: usize,
    /// Stage-chosen key.
    pub key: String,
}

impl MetadataKey {
    /// Creates a key.
    #[must_use]
    pub fn new(artifact: impl Into<String>, position: usize, key: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            position,
            key: key.into(),
        }
    }
}

/// Durable bookkeeping for incremental builds.
///
/// Stages record what they consumed; their staleness checks read it back on
/// later passes. A missing record means "never built" and must be treated as
/// stale by readers.
pub trait MetadataCache: Send + Sync {
    /// Loads a record.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store failed; a missing record is
    /// `Ok(None)`.
    fn load(&self, key: &MetadataKey) -> Result<Option<Value>, CacheError>;

    /// Stores a record, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store failed.
    fn store(&self, key: &MetadataKey, value: Value) -> Result<(), CacheError>;

    /// Removes a record. Removing an absent record succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store failed.
    fn remove(&self, key: &MetadataKey) -> Result<(), CacheError>;
}

/// A process-lifetime metadata cache with no persistence.
#[derive(Debug, Default)]
pub struct MemoryMetadataCache {
    entries: DashMap<MetadataKey, Value>,
}

impl MemoryMetadataCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MetadataCache for MemoryMetadataCache {
    fn load(&self, key: &MetadataKey) -> Result<Option<Value>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn store(&self, key: &MetadataKey, value: Value) -> Result<(), CacheError> {
        self.entries.insert(key.clone(), value);
        Ok(())
    }

    fn remove(&self, key: &MetadataKey) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    key: MetadataKey,
    value: Value,
}

/// A metadata cache persisted as one JSON file.
///
/// Every store rewrites the file through a temp file in the same directory
/// followed by an atomic rename, so a crash never leaves a torn cache.
#[derive(Debug)]
pub struct JsonFileCache {
    path: PathBuf,
    entries: DashMap<MetadataKey, Value>,
}

impl JsonFileCache {
    /// Opens a cache file, creating an empty cache when the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let entries = DashMap::new();
        match std::fs::read(&path) {
            Ok(bytes) => {
                let records: Vec<StoredRecord> = serde_json::from_slice(&bytes)?;
                for record in records {
                    entries.insert(record.key, record.value);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Self { path, entries })
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), CacheError> {
        let mut records: Vec<StoredRecord> = self
            .entries
            .iter()
            .map(|entry| StoredRecord {
                key: entry.key().clone(),
                value: entry.value().clone(),
            })
            .collect();
        // Stable on-disk order keeps the file diffable across runs.
        records.sort_by(|a, b| a.key.cmp(&b.key));
        let json = serde_json::to_vec_pretty(&records)?;

        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        let temp = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        std::fs::write(temp.path(), &json)?;
        temp.persist(&self.path)
            .map_err(|err| CacheError::Io { source: err.error })?;
        Ok(())
    }
}

impl MetadataCache for JsonFileCache {
    fn load(&self, key: &MetadataKey) -> Result<Option<Value>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn store(&self, key: &MetadataKey, value: Value) -> Result<(), CacheError> {
        self.entries.insert(key.clone(), value);
        self.persist()
    }

    fn remove(&self, key: &MetadataKey) -> Result<(), CacheError> {
        if self.entries.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}
