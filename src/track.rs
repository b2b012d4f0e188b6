//! Track data model: what comes in from a library export, what each metadata
//! source contributes, and the fused result the playlist builder consumes.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::camelot::{self, CamelotKey};

/// Neutral value for popularity, valence and energy when a track has none.
pub const NEUTRAL: f64 = 0.5;

/// A library track before enrichment. Only `id`, `title` and `artist` are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrack {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(
        default,
        alias = "key",
        deserialize_with = "camelot::deserialize_lenient"
    )]
    pub camelot_key: Option<CamelotKey>,
    #[serde(default)]
    pub energy: Option<f64>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub file_path: Option<String>,
}

impl RawTrack {
    pub fn new(id: impl Into<String>, artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            bpm: None,
            camelot_key: None,
            energy: None,
            duration_secs: None,
            file_path: None,
        }
    }

    /// Cache identity for this track's metadata lookups. Tracks with neither
    /// artist nor title are keyed by id so they don't share an entry.
    pub fn fingerprint(&self) -> String {
        if self.artist.trim().is_empty() && self.title.trim().is_empty() {
            return format!("id:{}", self.id);
        }
        fingerprint(&self.artist, &self.title)
    }
}

static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\(\[][^\)\]]*[\)\]]").expect("valid regex"));
static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("valid regex"));

/// Falls back to the trimmed lowercase text when nothing alphanumeric survives.
fn normalize_part(s: &str) -> String {
    let lower = s.to_lowercase();
    let stripped = BRACKETED.replace_all(&lower, " ");
    let normalized = NON_ALNUM.replace_all(&stripped, " ").trim().to_string();
    if normalized.is_empty() {
        lower.trim().to_string()
    } else {
        normalized
    }
}

/// Stable identity of a recording: lowercase artist and title with bracketed
/// qualifiers like "(Original Mix)" removed and punctuation collapsed.
pub fn fingerprint(artist: &str, title: &str) -> String {
    format!("{}|{}", normalize_part(artist), normalize_part(title))
}

/// Attributes a single source can supply. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subgenres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

impl EnrichmentFields {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One source's answer for one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub source: String,
    #[serde(flatten)]
    pub fields: EnrichmentFields,
    /// Source's self-reported confidence, 0..1
    pub confidence: f64,
    pub fetched_at: DateTime<Utc>,
}

impl EnrichmentRecord {
    pub fn new(source: impl Into<String>, fields: EnrichmentFields, confidence: f64) -> Self {
        Self {
            source: source.into(),
            fields,
            confidence: confidence.clamp(0.0, 1.0),
            fetched_at: Utc::now(),
        }
    }
}

/// A raw track plus fused enrichment. Absent attributes stay `None`; the
/// playlist side substitutes [`NEUTRAL`] where it needs a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTrack {
    #[serde(flatten)]
    pub track: RawTrack,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub subgenres: Vec<String>,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub popularity: Option<f64>,
    #[serde(default)]
    pub valence: Option<f64>,
    #[serde(default)]
    pub year: Option<i32>,
    /// Fraction of genre vote weight that backed the winning genre
    #[serde(default)]
    pub genre_confidence: f64,
    /// Sources that contributed a record, sorted by name
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub enrichment_timestamp: Option<DateTime<Utc>>,
}

impl EnrichedTrack {
    /// Wrap a track that no source could enrich.
    pub fn unenriched(track: RawTrack) -> Self {
        Self {
            track,
            genre: None,
            subgenres: Vec::new(),
            mood: None,
            language: None,
            region: None,
            popularity: None,
            valence: None,
            year: None,
            genre_confidence: 0.0,
            sources: Vec::new(),
            enrichment_timestamp: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.track.id
    }

    pub fn bpm(&self) -> Option<f64> {
        self.track.bpm.filter(|b| b.is_finite() && *b > 0.0)
    }

    pub fn key(&self) -> Option<CamelotKey> {
        self.track.camelot_key
    }

    pub fn energy_or_neutral(&self) -> f64 {
        unit_or_neutral(self.track.energy)
    }

    pub fn popularity_or_neutral(&self) -> f64 {
        unit_or_neutral(self.popularity)
    }

    pub fn valence_or_neutral(&self) -> f64 {
        unit_or_neutral(self.valence)
    }
}

fn unit_or_neutral(v: Option<f64>) -> f64 {
    match v {
        Some(x) if x.is_finite() => x.clamp(0.0, 1.0),
        _ => NEUTRAL,
    }
}
