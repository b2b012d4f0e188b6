//! Spotify Web API: popularity, valence and artist genres.
//!
//! Uses the client-credentials flow. One lookup is a search, then the audio
//! features of the best match, then its first artist's genres.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{HttpClient, min_interval};
use crate::config::SourceSettings;
use crate::enrich::source::{MetadataSource, SourceError, TrackQuery};
use crate::track::{EnrichmentFields, EnrichmentRecord};

pub const NAME: &str = "spotify";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_URL: &str = "https://api.spotify.com/v1";
const DEFAULT_INTERVAL_MS: u64 = 100;
const SEARCH_LIMIT: &str = "5";
/// Tokens are renewed this long before Spotify says they expire.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

const CONFIDENT: f64 = 0.85;
const FUZZY: f64 = 0.5;
const MAX_SUBGENRES: usize = 4;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchResponse {
    tracks: Option<TrackPage>,
}

#[derive(Debug, Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SpotifyTrack {
    id: String,
    popularity: Option<u32>,
    #[serde(default)]
    artists: Vec<ArtistRef>,
    album: Option<Album>,
}

#[derive(Debug, Deserialize)]
struct ArtistRef {
    id: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Album {
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AudioFeatures {
    valence: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Artist {
    #[serde(default)]
    genres: Vec<String>,
}

struct AccessToken {
    value: String,
    renew_at: Instant,
}

pub struct SpotifySource {
    client_id: Option<String>,
    client_secret: Option<String>,
    http: HttpClient,
    token: Mutex<Option<AccessToken>>,
}

impl SpotifySource {
    pub fn new(settings: &SourceSettings) -> Self {
        Self {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            http: HttpClient::new(settings.timeout(), min_interval(settings, DEFAULT_INTERVAL_MS)),
            token: Mutex::new(None),
        }
    }

    /// Current bearer token, requesting a new one when missing or about to expire.
    async fn access_token(&self) -> Result<String, SourceError> {
        let (Some(id), Some(secret)) = (&self.client_id, &self.client_secret) else {
            return Err(SourceError::Unavailable("no Spotify client credentials".into()));
        };

        let mut token = self.token.lock().await;
        if let Some(t) = token.as_ref() {
            if Instant::now() < t.renew_at {
                return Ok(t.value.clone());
            }
        }

        log::debug!("Requesting Spotify access token");
        let response: TokenResponse = self
            .http
            .post_form_json(
                TOKEN_URL,
                vec![
                    ("grant_type", "client_credentials".to_string()),
                    ("client_id", id.clone()),
                    ("client_secret", secret.clone()),
                ],
            )
            .await?
            .ok_or_else(|| SourceError::Unavailable("Spotify token endpoint not found".into()))?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_MARGIN);
        *token = Some(AccessToken {
            value: response.access_token.clone(),
            renew_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }
}

#[async_trait]
impl MetadataSource for SpotifySource {
    fn name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    async fn fetch(&self, query: &TrackQuery) -> Result<Option<EnrichmentRecord>, SourceError> {
        let token = self.access_token().await?;
        let auth = || vec![("Authorization", format!("Bearer {token}"))];

        let search: Option<SearchResponse> = self
            .http
            .get_json(
                &format!("{API_URL}/search"),
                vec![
                    ("q", format!("artist:\"{}\" track:\"{}\"", query.artist, query.title)),
                    ("type", "track".to_string()),
                    ("limit", SEARCH_LIMIT.to_string()),
                ],
                auth(),
            )
            .await?;
        let Some((track, confidence)) = search.and_then(|s| best_match(s, &query.artist)) else {
            return Ok(None);
        };

        // Features and genres are extras; a failure there keeps what the search gave.
        let features: Option<AudioFeatures> = self
            .http
            .get_json(&format!("{API_URL}/audio-features/{}", track.id), Vec::new(), auth())
            .await
            .unwrap_or_else(|e| {
                log::debug!("spotify: no audio features for {}: {e}", track.id);
                None
            });

        let genres = match track.artists.first().and_then(|a| a.id.as_deref()) {
            Some(artist_id) => self
                .http
                .get_json::<Artist>(&format!("{API_URL}/artists/{artist_id}"), Vec::new(), auth())
                .await
                .unwrap_or_else(|e| {
                    log::debug!("spotify: no genres for artist {artist_id}: {e}");
                    None
                })
                .map(|a| a.genres)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(record_from_parts(&track, features.as_ref(), &genres, confidence))
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// First result credited to the wanted artist, else the top result at lower confidence.
pub(crate) fn best_match(response: SearchResponse, artist: &str) -> Option<(SpotifyTrack, f64)> {
    let mut items = response.tracks?.items;
    if items.is_empty() {
        return None;
    }
    let wanted = normalize(artist);
    let matched = items.iter().position(|t| {
        t.artists.iter().any(|a| {
            let name = normalize(&a.name);
            !wanted.is_empty()
                && !name.is_empty()
                && (name.contains(&wanted) || wanted.contains(&name))
        })
    });
    Some(match matched {
        Some(i) => (items.swap_remove(i), CONFIDENT),
        None => (items.swap_remove(0), FUZZY),
    })
}

pub(crate) fn record_from_parts(
    track: &SpotifyTrack,
    features: Option<&AudioFeatures>,
    genres: &[String],
    confidence: f64,
) -> Option<EnrichmentRecord> {
    let mut genres = genres
        .iter()
        .map(|g| g.trim().to_lowercase())
        .filter(|g| !g.is_empty());

    let fields = EnrichmentFields {
        genre: genres.next(),
        subgenres: genres.take(MAX_SUBGENRES).collect(),
        popularity: track.popularity.map(|p| (p.min(100) as f64) / 100.0),
        valence: features
            .and_then(|f| f.valence)
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0)),
        year: track
            .album
            .as_ref()
            .and_then(|a| a.release_date.as_deref())
            .and_then(|d| d.get(..4))
            .and_then(|y| y.parse::<i32>().ok())
            .filter(|y| *y > 0),
        ..Default::default()
    };
    if fields.is_empty() {
        return None;
    }
    Some(EnrichmentRecord::new(NAME, fields, confidence))
}
