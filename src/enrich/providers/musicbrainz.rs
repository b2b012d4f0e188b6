//! MusicBrainz recording search: release year, country and folksonomy tags.

use async_trait::async_trait;
use serde::Deserialize;

use super::{HttpClient, min_interval};
use crate::config::SourceSettings;
use crate::enrich::source::{MetadataSource, SourceError, TrackQuery};
use crate::track::{EnrichmentFields, EnrichmentRecord};

pub const NAME: &str = "musicbrainz";
const SEARCH_URL: &str = "https://musicbrainz.org/ws/2/recording";
/// MusicBrainz allows one request per second per client.
const DEFAULT_INTERVAL_MS: u64 = 1000;
/// Search scores below this are usually a different recording.
const MIN_SCORE: u32 = 60;

#[derive(Debug, Deserialize)]
pub(crate) struct SearchResponse {
    #[serde(default)]
    recordings: Vec<Recording>,
}

#[derive(Debug, Deserialize)]
struct Recording {
    #[serde(default)]
    score: u32,
    #[serde(rename = "first-release-date")]
    first_release_date: Option<String>,
    #[serde(default)]
    releases: Vec<Release>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Release {
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
    #[serde(default)]
    count: i64,
}

pub struct MusicBrainzSource {
    http: HttpClient,
}

impl MusicBrainzSource {
    pub fn new(settings: &SourceSettings) -> Self {
        Self {
            http: HttpClient::new(settings.timeout(), min_interval(settings, DEFAULT_INTERVAL_MS)),
        }
    }
}

/// Lucene phrase with quotes and backslashes stripped.
fn phrase(s: &str) -> String {
    s.chars().filter(|c| *c != '"' && *c != '\\').collect()
}

#[async_trait]
impl MetadataSource for MusicBrainzSource {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&self, query: &TrackQuery) -> Result<Option<EnrichmentRecord>, SourceError> {
        let lucene = format!(
            "artist:\"{}\" AND recording:\"{}\"",
            phrase(&query.artist),
            phrase(&query.title)
        );
        let response: Option<SearchResponse> = self
            .http
            .get_json(
                SEARCH_URL,
                vec![
                    ("query", lucene),
                    ("fmt", "json".to_string()),
                    ("limit", "5".to_string()),
                ],
                vec![("Accept", "application/json".to_string())],
            )
            .await?;

        Ok(response.and_then(record_from_search))
    }
}

pub(crate) fn record_from_search(response: SearchResponse) -> Option<EnrichmentRecord> {
    let best = response
        .recordings
        .into_iter()
        .filter(|r| r.score >= MIN_SCORE)
        .max_by_key(|r| r.score)?;

    let year = best
        .first_release_date
        .as_deref()
        .and_then(|d| d.get(..4))
        .and_then(|y| y.parse::<i32>().ok());
    let region = best
        .releases
        .iter()
        .find_map(|r| r.country.clone().filter(|c| !c.is_empty()));

    let mut tags = best.tags;
    tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    let mut tag_names = tags.into_iter().map(|t| t.name);

    let fields = EnrichmentFields {
        genre: tag_names.next(),
        subgenres: tag_names.take(3).collect(),
        region,
        year,
        ..Default::default()
    };
    if fields.is_empty() {
        return None;
    }
    Some(EnrichmentRecord::new(NAME, fields, f64::from(best.score) / 100.0))
}
