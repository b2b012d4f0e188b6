//! Multi-source metadata enrichment.
//!
//! For every track, every registered source is asked (through the cache)
//! concurrently. Each source has its own concurrency limit and timeout. Whatever
//! comes back is fused by [`fusion::fuse`]. A failing source only loses its own
//! contribution for that one track.

pub mod fusion;
pub mod providers;
pub mod source;

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use thiserror::Error;

use crate::cache::{CacheKey, CacheStore, Cached};
use crate::config::{ConfigError, SourceWeights};
use crate::track::{EnrichedTrack, EnrichmentRecord, RawTrack};
pub use source::{MetadataSource, SourceError, SourceLimits, SourceRegistry, TrackQuery};
use source::RegisteredSource;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("enrichment cancelled")]
    Cancelled,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct SourceFusionEngine {
    registry: SourceRegistry,
    weights: SourceWeights,
    cache: Arc<CacheStore<EnrichmentRecord>>,
    refresh: bool,
}

impl SourceFusionEngine {
    /// Every registered source needs a configured weight.
    pub fn new(
        registry: SourceRegistry,
        weights: SourceWeights,
        cache: Arc<CacheStore<EnrichmentRecord>>,
    ) -> Result<Self, ConfigError> {
        for name in registry.names() {
            if weights.get(name).is_none() {
                return Err(ConfigError::MissingWeight(name.to_string()));
            }
        }
        Ok(Self {
            registry,
            weights,
            cache,
            refresh: false,
        })
    }

    /// Ignore stored cache entries and ask every source again.
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn cache(&self) -> &CacheStore<EnrichmentRecord> {
        &self.cache
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.registry.names()
    }

    /// Enrich one track. Never fails: sources that error or time out are
    /// logged and left out of the fusion.
    pub async fn enrich(&self, track: &RawTrack) -> EnrichedTrack {
        let query = TrackQuery::from(track);
        let lookups = self
            .registry
            .iter()
            .map(|source| self.lookup(source, &query));
        let records: Vec<EnrichmentRecord> = join_all(lookups).await.into_iter().flatten().collect();

        log::debug!(
            "Enriched {} ({}) from {} of {} sources",
            track.id,
            query.fingerprint,
            records.len(),
            self.registry.len()
        );
        fusion::fuse(track.clone(), &records, &self.weights)
    }

    async fn lookup(&self, registered: &RegisteredSource, query: &TrackQuery) -> Option<EnrichmentRecord> {
        let name = registered.name().to_string();
        let key = CacheKey::new(name.clone(), query.fingerprint.clone());

        let source = Arc::clone(&registered.source);
        let permits = Arc::clone(&registered.permits);
        let timeout = registered.limits.timeout;
        let owned_query = query.clone();
        let fetch = move || async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return Err(SourceError::Unavailable("source shut down".into()));
            };
            let outcome: Result<Cached<EnrichmentRecord>, SourceError> =
                match tokio::time::timeout(timeout, source.fetch(&owned_query)).await {
                    Ok(Ok(Some(record))) => Ok(Cached::Value(record)),
                    Ok(Ok(None)) => Ok(Cached::Miss),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(SourceError::Timeout(timeout)),
                };
            outcome
        };

        let result = if self.refresh {
            self.cache.refresh(key, fetch).await
        } else {
            self.cache.get_or_fetch(key, fetch).await
        };

        match result {
            Ok(cached) => cached.into_option().map(|mut record| {
                // The cache key decides which weight applies
                record.source = name;
                record
            }),
            Err(e) => {
                log::warn!("{name}: lookup failed for {:?}: {e}", query.fingerprint);
                None
            }
        }
    }

    /// Enrich `tracks` with up to `concurrency` tracks in flight. Output order
    /// matches input order. `on_done` runs as each track finishes.
    pub async fn enrich_all<F>(
        &self,
        tracks: &[RawTrack],
        concurrency: usize,
        mut on_done: F,
    ) -> Vec<EnrichedTrack>
    where
        F: FnMut(&EnrichedTrack),
    {
        futures::stream::iter(tracks)
            .map(|track| self.enrich(track))
            .buffered(concurrency.max(1))
            .inspect(|enriched| on_done(enriched))
            .collect()
            .await
    }

    /// [`enrich_all`](Self::enrich_all), abandoned as a whole when `cancel`
    /// resolves first. Fetches already started keep running and still land
    /// in the cache.
    pub async fn enrich_all_until<F, C>(
        &self,
        tracks: &[RawTrack],
        concurrency: usize,
        on_done: F,
        cancel: C,
    ) -> Result<Vec<EnrichedTrack>, EnrichError>
    where
        F: FnMut(&EnrichedTrack),
        C: Future<Output = ()>,
    {
        tokio::select! {
            enriched = self.enrich_all(tracks, concurrency, on_done) => Ok(enriched),
            () = cancel => {
                log::warn!("Enrichment cancelled");
                Err(EnrichError::Cancelled)
            }
        }
    }
}
