//! Backing stores for [`CacheStore`](super::CacheStore).
//!
//! Backends only persist opaque entries with their expiry metadata. Freshness,
//! single-flight and (de)serialization are handled by the store on top.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{CacheError, CacheKey};
use crate::db::Database;

/// What a backend persists for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    /// JSON-encoded value (or miss marker).
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: i64,
}

impl StoredEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at).num_milliseconds() >= self.ttl_ms
    }
}

/// Key/value storage with expiry metadata. Local or remote, the store's
/// guarantees hold either way since all coordination happens above this trait.
pub trait CacheBackend: Send + Sync {
    fn load(&self, key: &CacheKey) -> Result<Option<StoredEntry>, CacheError>;
    fn store(&self, key: &CacheKey, entry: &StoredEntry) -> Result<(), CacheError>;
    fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;
    /// Remove everything; returns how many entries were dropped.
    fn clear(&self) -> Result<usize, CacheError>;
    fn len(&self) -> Result<usize, CacheError>;
}

/// Process-local backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<CacheKey, StoredEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, StoredEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self, key: &CacheKey) -> Result<Option<StoredEntry>, CacheError> {
        Ok(self.entries().get(key).cloned())
    }

    fn store(&self, key: &CacheKey, entry: &StoredEntry) -> Result<(), CacheError> {
        self.entries().insert(key.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = self.entries();
        let n = entries.len();
        entries.clear();
        Ok(n)
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries().len())
    }
}

/// Backend persisting to the `enrichment_cache` table.
pub struct SqliteBackend {
    db: Mutex<Database>,
}

impl SqliteBackend {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self, CacheError> {
        Ok(Self::new(Database::open(path)?))
    }

    fn db(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheBackend for SqliteBackend {
    fn load(&self, key: &CacheKey) -> Result<Option<StoredEntry>, CacheError> {
        Ok(self.db().get_cache_entry(&key.source, &key.fingerprint)?)
    }

    fn store(&self, key: &CacheKey, entry: &StoredEntry) -> Result<(), CacheError> {
        Ok(self
            .db()
            .put_cache_entry(&key.source, &key.fingerprint, entry)?)
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        Ok(self.db().delete_cache_entry(&key.source, &key.fingerprint)?)
    }

    fn clear(&self) -> Result<usize, CacheError> {
        Ok(self.db().clear_cache()?)
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.db().cache_entry_count()?)
    }
}
