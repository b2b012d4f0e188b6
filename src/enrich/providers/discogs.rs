//! Discogs database search: genre, styles, country and year of a release.

use async_trait::async_trait;
use serde::Deserialize;

use super::{HttpClient, min_interval};
use crate::config::SourceSettings;
use crate::enrich::source::{MetadataSource, SourceError, TrackQuery};
use crate::track::{EnrichmentFields, EnrichmentRecord};

pub const NAME: &str = "discogs";
const SEARCH_URL: &str = "https://api.discogs.com/database/search";
/// Authenticated clients get 60 requests a minute.
const DEFAULT_INTERVAL_MS: u64 = 1100;

const CONFIDENT: f64 = 0.9;
const FUZZY: f64 = 0.6;

#[derive(Debug, Deserialize)]
pub(crate) struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    title: Option<String>,
    year: Option<String>,
    country: Option<String>,
    #[serde(default)]
    genre: Vec<String>,
    #[serde(default)]
    style: Vec<String>,
}

pub struct DiscogsSource {
    token: Option<String>,
    http: HttpClient,
}

impl DiscogsSource {
    pub fn new(settings: &SourceSettings) -> Self {
        Self {
            token: settings.token.clone(),
            http: HttpClient::new(settings.timeout(), min_interval(settings, DEFAULT_INTERVAL_MS)),
        }
    }
}

#[async_trait]
impl MetadataSource for DiscogsSource {
    fn name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.token.is_some()
    }

    async fn fetch(&self, query: &TrackQuery) -> Result<Option<EnrichmentRecord>, SourceError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| SourceError::Unavailable("no Discogs token".into()))?;

        let response: Option<SearchResponse> = self
            .http
            .get_json(
                SEARCH_URL,
                vec![
                    ("q", format!("{} {}", query.artist, query.title)),
                    ("type", "release".to_string()),
                    ("per_page", "5".to_string()),
                ],
                vec![("Authorization", format!("Discogs token={token}"))],
            )
            .await?;

        Ok(response.and_then(|r| record_from_search(&r, &query.artist)))
    }
}

/// Lowercase, alphanumerics and spaces only.
fn normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Prefer the first result whose title ("Artist - Release") names the artist;
/// fall back to the top result at lower confidence.
pub(crate) fn record_from_search(response: &SearchResponse, artist: &str) -> Option<EnrichmentRecord> {
    let first = response.results.first()?;
    let wanted = normalize(artist);
    let matched = response.results.iter().find(|r| {
        let title = normalize(r.title.as_deref().unwrap_or(""));
        wanted.len() < 3 || title.contains(&wanted)
    });
    let (result, confidence) = match matched {
        Some(r) => (r, CONFIDENT),
        None => (first, FUZZY),
    };

    let fields = EnrichmentFields {
        genre: result.genre.first().cloned(),
        subgenres: result.style.clone(),
        region: result.country.clone().filter(|c| !c.is_empty()),
        year: result
            .year
            .as_deref()
            .and_then(|y| y.trim().parse::<i32>().ok())
            .filter(|y| *y > 0),
        ..Default::default()
    };
    if fields.is_empty() {
        return None;
    }
    Some(EnrichmentRecord::new(NAME, fields, confidence))
}
