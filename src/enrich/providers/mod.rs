//! Concrete metadata providers over HTTP.
//!
//! ureq is blocking, so requests run on tokio's blocking pool. Each provider
//! holds a governor limiter to stay under the service's rate limit.

pub mod discogs;
pub mod lastfm;
pub mod musicbrainz;
pub mod spotify;

use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::de::DeserializeOwned;

use super::source::{MetadataSource, SourceError, SourceLimits, SourceRegistry};
use crate::config::{AppConfig, SourceSettings};

pub const USER_AGENT: &str = concat!("setflow/", env!("CARGO_PKG_VERSION"));

/// One request per `min_interval`, no bursts. `None` when unthrottled.
fn rate_limiter(min_interval: Duration) -> Option<DefaultDirectRateLimiter> {
    Quota::with_period(min_interval).map(RateLimiter::direct)
}

pub(crate) struct HttpClient {
    agent: ureq::Agent,
    rate_limiter: Option<DefaultDirectRateLimiter>,
}

impl HttpClient {
    pub fn new(timeout: Duration, min_interval: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .user_agent(USER_AGENT)
            .build()
            .into();
        Self {
            agent,
            rate_limiter: rate_limiter(min_interval),
        }
    }

    /// GET `url` and decode a JSON body. `Ok(None)` for 404.
    pub async fn get_json<T>(
        &self,
        url: &str,
        query: Vec<(&'static str, String)>,
        headers: Vec<(&'static str, String)>,
    ) -> Result<Option<T>, SourceError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }
        let agent = self.agent.clone();
        let url = url.to_string();

        tokio::task::spawn_blocking(move || {
            let mut request = agent.get(&url);
            for (key, value) in &query {
                request = request.query(*key, value);
            }
            for (name, value) in &headers {
                request = request.header(*name, value.as_str());
            }
            let response = request
                .call()
                .map_err(|e| SourceError::Http(e.to_string()))?;
            read_json(response, &url)
        })
        .await
        .map_err(|e| SourceError::Unavailable(format!("request task failed: {e}")))?
    }

    /// POST a urlencoded form and decode a JSON body. `Ok(None)` for 404.
    pub async fn post_form_json<T>(
        &self,
        url: &str,
        form: Vec<(&'static str, String)>,
    ) -> Result<Option<T>, SourceError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }
        let agent = self.agent.clone();
        let url = url.to_string();

        tokio::task::spawn_blocking(move || {
            let response = agent
                .post(&url)
                .send_form(form.iter().map(|(k, v)| (*k, v.as_str())))
                .map_err(|e| SourceError::Http(e.to_string()))?;
            read_json(response, &url)
        })
        .await
        .map_err(|e| SourceError::Unavailable(format!("request task failed: {e}")))?
    }
}

fn read_json<T: DeserializeOwned>(
    mut response: ureq::http::Response<ureq::Body>,
    url: &str,
) -> Result<Option<T>, SourceError> {
    let status = response.status().as_u16();
    match status {
        200..=299 => response
            .body_mut()
            .read_json::<T>()
            .map(Some)
            .map_err(|e| SourceError::Malformed(e.to_string())),
        404 => Ok(None),
        _ => Err(SourceError::Http(format!("HTTP {status} from {url}"))),
    }
}

fn limits(settings: &SourceSettings) -> SourceLimits {
    SourceLimits {
        timeout: settings.timeout(),
        concurrency: settings.concurrency,
    }
}

fn min_interval(settings: &SourceSettings, default_ms: u64) -> Duration {
    Duration::from_millis(settings.min_interval_ms.unwrap_or(default_ms))
}

/// Registry of the shipped providers that are enabled and have what they
/// need to run (credentials), in a fixed order.
pub fn build_registry(config: &AppConfig) -> SourceRegistry {
    let mut registry = SourceRegistry::new();

    let candidates: Vec<(Arc<dyn MetadataSource>, SourceSettings)> = [
        discogs::NAME,
        lastfm::NAME,
        musicbrainz::NAME,
        spotify::NAME,
    ]
    .into_iter()
    .filter_map(|name| {
        let settings = config.source(name);
        if !settings.enabled {
            log::info!("Source {name} disabled in config");
            return None;
        }
        let source: Arc<dyn MetadataSource> = match name {
            discogs::NAME => Arc::new(discogs::DiscogsSource::new(&settings)),
            lastfm::NAME => Arc::new(lastfm::LastfmSource::new(&settings)),
            spotify::NAME => Arc::new(spotify::SpotifySource::new(&settings)),
            _ => Arc::new(musicbrainz::MusicBrainzSource::new(&settings)),
        };
        Some((source, settings))
    })
    .collect();

    for (source, settings) in candidates {
        if source.is_available() {
            registry.register(source, limits(&settings));
        } else {
            log::info!("Source {} skipped: no credentials", source.name());
        }
    }
    registry
}
