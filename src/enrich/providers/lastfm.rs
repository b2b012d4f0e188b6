//! Last.fm `track.getInfo`: community tags and listener counts.

use async_trait::async_trait;
use serde::Deserialize;

use super::{HttpClient, min_interval};
use crate::config::SourceSettings;
use crate::enrich::source::{MetadataSource, SourceError, TrackQuery};
use crate::track::{EnrichmentFields, EnrichmentRecord};

pub const NAME: &str = "lastfm";
const API_URL: &str = "https://ws.audioscrobbler.com/2.0/";
const DEFAULT_INTERVAL_MS: u64 = 250;
const CONFIDENCE: f64 = 0.7;
/// Listener count that maps to popularity 1.0 (10^7).
const POPULARITY_LOG_CEILING: f64 = 7.0;
/// Last.fm error code for an unknown track.
const ERR_NOT_FOUND: i64 = 6;
const MAX_SUBGENRES: usize = 4;

const MOOD_TAGS: &[&str] = &[
    "aggressive", "atmospheric", "chill", "chillout", "dark", "dreamy", "energetic", "euphoric",
    "happy", "hypnotic", "melancholic", "melancholy", "mellow", "romantic", "sad", "sexy",
    "uplifting", "upbeat", "groovy", "relaxing", "emotional", "party",
];

/// Tags that say nothing about the music.
const NOISE_TAGS: &[&str] = &[
    "seen live", "favorites", "favourite", "favorite", "favourites", "love", "awesome",
    "my playlist", "beautiful", "cool", "good",
];

#[derive(Debug, Deserialize)]
pub(crate) struct InfoResponse {
    track: Option<TrackInfo>,
    error: Option<i64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrackInfo {
    listeners: Option<String>,
    toptags: Option<TopTags>,
}

#[derive(Debug, Deserialize)]
struct TopTags {
    #[serde(default)]
    tag: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

pub struct LastfmSource {
    api_key: Option<String>,
    http: HttpClient,
}

impl LastfmSource {
    pub fn new(settings: &SourceSettings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            http: HttpClient::new(settings.timeout(), min_interval(settings, DEFAULT_INTERVAL_MS)),
        }
    }
}

#[async_trait]
impl MetadataSource for LastfmSource {
    fn name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn fetch(&self, query: &TrackQuery) -> Result<Option<EnrichmentRecord>, SourceError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| SourceError::Unavailable("no Last.fm API key".into()))?;

        let response: Option<InfoResponse> = self
            .http
            .get_json(
                API_URL,
                vec![
                    ("method", "track.getInfo".to_string()),
                    ("api_key", api_key),
                    ("artist", query.artist.clone()),
                    ("track", query.title.clone()),
                    ("autocorrect", "1".to_string()),
                    ("format", "json".to_string()),
                ],
                Vec::new(),
            )
            .await?;

        match response {
            Some(r) => record_from_info(r),
            None => Ok(None),
        }
    }
}

/// `log10(listeners + 1) / 7`, capped at 1.
fn popularity_from_listeners(listeners: u64) -> f64 {
    ((listeners as f64 + 1.0).log10() / POPULARITY_LOG_CEILING).min(1.0)
}

pub(crate) fn record_from_info(response: InfoResponse) -> Result<Option<EnrichmentRecord>, SourceError> {
    match response.error {
        Some(ERR_NOT_FOUND) => return Ok(None),
        Some(code) => {
            return Err(SourceError::Http(format!(
                "Last.fm error {code}: {}",
                response.message.unwrap_or_default()
            )));
        }
        None => {}
    }
    let Some(track) = response.track else {
        return Ok(None);
    };

    let mut fields = EnrichmentFields {
        popularity: track
            .listeners
            .as_deref()
            .and_then(|l| l.parse::<u64>().ok())
            .map(popularity_from_listeners),
        ..Default::default()
    };

    let tags = track.toptags.map(|t| t.tag).unwrap_or_default();
    for tag in tags {
        let name = tag.name.trim().to_lowercase();
        if name.is_empty() || NOISE_TAGS.contains(&name.as_str()) {
            continue;
        }
        if MOOD_TAGS.contains(&name.as_str()) {
            if fields.mood.is_none() {
                fields.mood = Some(name);
            }
        } else if fields.genre.is_none() {
            fields.genre = Some(name);
        } else if fields.subgenres.len() < MAX_SUBGENRES {
            fields.subgenres.push(name);
        }
    }

    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(EnrichmentRecord::new(NAME, fields, CONFIDENCE)))
}
