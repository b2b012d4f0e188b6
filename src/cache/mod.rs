//! TTL cache with single-flight fetches.
//!
//! [`CacheStore::get_or_fetch`] returns a fresh stored value when there is one.
//! Otherwise it joins the fetch already running for that key, or starts one.
//! Fetches run on their own task, so a fetch whose callers have all gone away
//! still completes and populates the cache.

pub mod backend;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backend::{CacheBackend, MemoryBackend, SqliteBackend, StoredEntry};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Db(#[from] crate::db::DbError),

    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Why a fetch produced no cacheable answer. Never stored.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("{0}")]
    Failed(String),

    #[error("fetch task aborted: {0}")]
    Aborted(String),
}

/// (source, fingerprint)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub source: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(source: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.fingerprint)
    }
}

/// A cached answer: a value, or a remembered "nothing found".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Cached<V> {
    Value(V),
    Miss,
}

impl<V> Cached<V> {
    pub fn into_option(self) -> Option<V> {
        match self {
            Cached::Value(v) => Some(v),
            Cached::Miss => None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    fetches: AtomicU64,
    joined: AtomicU64,
    expired: AtomicU64,
    corrupt: AtomicU64,
}

/// Snapshot of a store's activity since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Served from the backing store
    pub hits: u64,
    /// Fetches started
    pub fetches: u64,
    /// Callers that attached to a fetch already in flight
    pub joined: u64,
    pub expired: u64,
    pub corrupt: u64,
}

type InFlight<V> = Shared<BoxFuture<'static, Result<Cached<V>, FetchError>>>;
type InFlightMap<V> = Arc<Mutex<HashMap<CacheKey, InFlight<V>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct CacheStore<V> {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    negative_ttl: Duration,
    inflight: InFlightMap<V>,
    counters: Arc<Counters>,
}

impl<V> CacheStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Values and misses both live for `ttl` until [`with_negative_ttl`](Self::with_negative_ttl) says otherwise.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            negative_ttl: ttl,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_negative_ttl(mut self, negative_ttl: Duration) -> Self {
        self.negative_ttl = negative_ttl;
        self
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            corrupt: c.corrupt.load(Ordering::Relaxed),
        }
    }

    /// Fresh stored answer for `key`, if any. Expired and undecodable entries
    /// are removed and reported as absent.
    pub async fn lookup(&self, key: &CacheKey) -> Option<Cached<V>> {
        load_fresh(&self.backend, &self.counters, key).await
    }

    /// Cached answer for `key`, fetching it with `fetch` when absent or stale.
    ///
    /// `Ok(Cached::Miss)` from `fetch` is remembered for the negative TTL;
    /// errors are returned to every waiting caller and not stored.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: CacheKey,
        fetch: F,
    ) -> Result<Cached<V>, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Cached<V>, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.get_or_fetch_inner(key, fetch, true).await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch) but ignores stored entries.
    /// Concurrent callers still share one fetch.
    pub async fn refresh<F, Fut, E>(&self, key: CacheKey, fetch: F) -> Result<Cached<V>, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Cached<V>, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.get_or_fetch_inner(key, fetch, false).await
    }

    async fn get_or_fetch_inner<F, Fut, E>(
        &self,
        key: CacheKey,
        fetch: F,
        use_stored: bool,
    ) -> Result<Cached<V>, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Cached<V>, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if use_stored {
            if let Some(cached) = self.lookup(&key).await {
                log::trace!("Cache hit: {key}");
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached);
            }
        }

        // Only map bookkeeping happens under the lock; storage reads stay outside it.
        let pending = {
            let mut inflight = lock(&self.inflight);
            if let Some(pending) = inflight.get(&key) {
                log::trace!("Joining in-flight fetch for {key}");
                self.counters.joined.fetch_add(1, Ordering::Relaxed);
                pending.clone()
            } else {
                let pending = self.spawn_fetch(key.clone(), fetch, use_stored);
                inflight.insert(key, pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Run `fetch` on its own task. With `recheck`, the store is consulted
    /// again first: a fetch for the same key may have finished between the
    /// caller's lookup and its claim on the in-flight slot.
    fn spawn_fetch<F, Fut, E>(&self, key: CacheKey, fetch: F, recheck: bool) -> InFlight<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Cached<V>, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let inflight = Arc::clone(&self.inflight);
        let counters = Arc::clone(&self.counters);
        let (ttl, negative_ttl) = (self.ttl, self.negative_ttl);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let stored: Option<Cached<V>> = if recheck {
                load_fresh(&backend, &counters, &task_key).await
            } else {
                None
            };
            let result = match stored {
                Some(cached) => {
                    log::trace!("Cache hit on recheck: {task_key}");
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(cached)
                }
                None => {
                    log::debug!("Cache miss, fetching: {task_key}");
                    counters.fetches.fetch_add(1, Ordering::Relaxed);
                    match fetch().await {
                        Ok(cached) => {
                            let ttl = match cached {
                                Cached::Value(_) => ttl,
                                Cached::Miss => negative_ttl,
                            };
                            persist(&backend, &task_key, &cached, ttl).await;
                            Ok(cached)
                        }
                        Err(e) => Err(FetchError::Failed(e.to_string())),
                    }
                }
            };
            // Stored before leaving the in-flight map, so later callers
            // always find one or the other.
            lock(&inflight).remove(&task_key);
            result
        });

        let inflight = Arc::clone(&self.inflight);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    lock(&inflight).remove(&key);
                    Err(FetchError::Aborted(join_err.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Backend reads and writes are synchronous, so they go to the blocking pool.
async fn load_fresh<V: DeserializeOwned>(
    backend: &Arc<dyn CacheBackend>,
    counters: &Counters,
    key: &CacheKey,
) -> Option<Cached<V>> {
    let task_backend = Arc::clone(backend);
    let task_key = key.clone();
    let entry = match tokio::task::spawn_blocking(move || task_backend.load(&task_key)).await {
        Ok(Ok(Some(entry))) => entry,
        Ok(Ok(None)) => return None,
        Ok(Err(e)) => {
            log::warn!("Cache read failed for {key}: {e}");
            return None;
        }
        Err(e) => {
            log::warn!("Cache read task failed for {key}: {e}");
            return None;
        }
    };

    if entry.is_expired(Utc::now()) {
        log::debug!("Cache entry expired: {key}");
        counters.expired.fetch_add(1, Ordering::Relaxed);
        evict(backend, key).await;
        return None;
    }

    match serde_json::from_str::<Cached<V>>(&entry.payload) {
        Ok(cached) => Some(cached),
        Err(e) => {
            log::warn!("Discarding corrupt cache entry {key}: {e}");
            counters.corrupt.fetch_add(1, Ordering::Relaxed);
            evict(backend, key).await;
            None
        }
    }
}

async fn evict(backend: &Arc<dyn CacheBackend>, key: &CacheKey) {
    let task_backend = Arc::clone(backend);
    let task_key = key.clone();
    match tokio::task::spawn_blocking(move || task_backend.remove(&task_key)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Failed to evict cache entry {key}: {e}"),
        Err(e) => log::warn!("Cache evict task failed for {key}: {e}"),
    }
}

async fn persist<V: Serialize>(
    backend: &Arc<dyn CacheBackend>,
    key: &CacheKey,
    cached: &Cached<V>,
    ttl: Duration,
) {
    let payload = match serde_json::to_string(cached) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Failed to encode cache entry {key}: {e}");
            return;
        }
    };
    let entry = StoredEntry {
        payload,
        created_at: Utc::now(),
        ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
    };
    let task_backend = Arc::clone(backend);
    let task_key = key.clone();
    match tokio::task::spawn_blocking(move || task_backend.store(&task_key, &entry)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Failed to store cache entry {key}: {e}"),
        Err(e) => log::warn!("Cache write task failed for {key}: {e}"),
    }
}
