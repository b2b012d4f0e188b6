//! The metadata source capability and the registry the engine runs over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::track::{EnrichmentRecord, RawTrack};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// What a source gets to identify a track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackQuery {
    pub artist: String,
    pub title: String,
    pub fingerprint: String,
}

impl From<&RawTrack> for TrackQuery {
    fn from(track: &RawTrack) -> Self {
        Self {
            artist: track.artist.clone(),
            title: track.title.clone(),
            fingerprint: track.fingerprint(),
        }
    }
}

/// A pluggable metadata provider.
///
/// `Ok(None)` means the source answered and has nothing for this track; it is
/// remembered. `Err` is treated as transient and retried on the next lookup.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Stable name; used for weights, cache keys and logs.
    fn name(&self) -> &str;

    /// False when the source can't work in this environment (no credentials).
    fn is_available(&self) -> bool {
        true
    }

    async fn fetch(&self, query: &TrackQuery) -> Result<Option<EnrichmentRecord>, SourceError>;
}

/// Per-source call limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceLimits {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            concurrency: 2,
        }
    }
}

pub(crate) struct RegisteredSource {
    pub source: Arc<dyn MetadataSource>,
    pub limits: SourceLimits,
    pub permits: Arc<Semaphore>,
}

impl RegisteredSource {
    pub fn name(&self) -> &str {
        self.source.name()
    }
}

/// Ordered set of sources, fixed at startup.
#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<RegisteredSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source. A second source with the same name replaces the first.
    pub fn register(&mut self, source: Arc<dyn MetadataSource>, limits: SourceLimits) {
        let limits = SourceLimits {
            concurrency: limits.concurrency.max(1),
            ..limits
        };
        let entry = RegisteredSource {
            permits: Arc::new(Semaphore::new(limits.concurrency)),
            source,
            limits,
        };
        match self.sources.iter().position(|s| s.name() == entry.name()) {
            Some(i) => {
                log::warn!("Replacing already registered source {:?}", entry.name());
                self.sources[i] = entry;
            }
            None => self.sources.push(entry),
        }
    }

    pub fn with(mut self, source: Arc<dyn MetadataSource>, limits: SourceLimits) -> Self {
        self.register(source, limits);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &RegisteredSource> {
        self.sources.iter()
    }
}
