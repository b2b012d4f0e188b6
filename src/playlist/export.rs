//! Playlist writers: JSON, extended M3U and CSV.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::{Playlist, TransitionScore};
use crate::track::EnrichedTrack;

pub const DEFAULT_PLAYLIST_NAME: &str = "setflow";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    M3u,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::M3u => "m3u",
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "m3u" | "m3u8" => Ok(ExportFormat::M3u),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unknown export format {other:?} (expected json, m3u or csv)")),
        }
    }
}

#[derive(Serialize)]
struct JsonTrack<'a> {
    position: usize,
    #[serde(flatten)]
    track: &'a EnrichedTrack,
    transition: Option<&'a TransitionScore>,
}

#[derive(Serialize)]
struct JsonPlaylist<'a> {
    generated_at: DateTime<Utc>,
    track_count: usize,
    target_length: usize,
    shortfall: usize,
    tracks: Vec<JsonTrack<'a>>,
}

pub fn to_json(playlist: &Playlist) -> Result<String, ExportError> {
    let doc = JsonPlaylist {
        generated_at: Utc::now(),
        track_count: playlist.len(),
        target_length: playlist.target_length,
        shortfall: playlist.shortfall,
        tracks: playlist
            .entries
            .iter()
            .map(|e| JsonTrack {
                position: e.position,
                track: &e.track,
                transition: e.transition.as_ref(),
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// M3U is line-oriented; embedded line breaks would split an entry.
fn single_line(s: &str) -> String {
    s.replace(|c: char| c == '\r' || c == '\n', " ")
}

/// Extended M3U. Tracks without a file path fall back to their id.
pub fn to_m3u(playlist: &Playlist, name: &str) -> String {
    let mut out = String::from("#EXTM3U\n");
    out.push_str(&format!("#PLAYLIST:{}\n", single_line(name)));
    for entry in &playlist.entries {
        let t = &entry.track.track;
        let secs = t.duration_secs.map_or(-1, |d| d.round() as i64);
        out.push_str(&format!(
            "#EXTINF:{secs},{} - {}\n",
            single_line(&t.artist),
            single_line(&t.title)
        ));
        out.push_str(&single_line(t.file_path.as_deref().unwrap_or(&t.id)));
        out.push('\n');
    }
    out
}

const CSV_HEADER: &[&str] = &[
    "position",
    "id",
    "artist",
    "title",
    "bpm",
    "camelot_key",
    "energy",
    "duration_secs",
    "genre",
    "subgenres",
    "mood",
    "popularity",
    "valence",
    "year",
    "genre_confidence",
    "sources",
    "file_path",
    "final_score",
    "reason",
];

/// RFC 4180 field: always quoted, inner quotes doubled.
fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn to_csv(playlist: &Playlist) -> String {
    let mut rows = vec![CSV_HEADER.iter().map(|h| csv_field(h)).collect::<Vec<_>>().join(",")];
    for entry in &playlist.entries {
        let e = &entry.track;
        let t = &e.track;
        let fields = [
            entry.position.to_string(),
            t.id.clone(),
            t.artist.clone(),
            t.title.clone(),
            opt(t.bpm),
            opt(t.camelot_key),
            opt(t.energy),
            opt(t.duration_secs),
            e.genre.clone().unwrap_or_default(),
            e.subgenres.join(";"),
            e.mood.clone().unwrap_or_default(),
            opt(e.popularity),
            opt(e.valence),
            opt(e.year),
            format!("{:.3}", e.genre_confidence),
            e.sources.join(";"),
            t.file_path.clone().unwrap_or_default(),
            opt(entry.transition.as_ref().map(|s| format!("{:.4}", s.final_score))),
            entry.transition.as_ref().map(|s| s.reason.clone()).unwrap_or_default(),
        ];
        rows.push(fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(","));
    }
    let mut out = rows.join("\r\n");
    out.push_str("\r\n");
    out
}

pub fn export(playlist: &Playlist, format: ExportFormat, name: &str) -> Result<String, ExportError> {
    match format {
        ExportFormat::Json => to_json(playlist),
        ExportFormat::M3u => Ok(to_m3u(playlist, name)),
        ExportFormat::Csv => Ok(to_csv(playlist)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::PlaylistEntry;
    use crate::track::RawTrack;

    fn sample() -> Playlist {
        let mut first = RawTrack::new("b-2", "Moodymann", "Shades of \"Jae\"");
        first.bpm = Some(118.0);
        first.camelot_key = "5A".parse().ok();
        first.duration_secs = Some(421.4);
        first.file_path = Some("/music/moodymann/shades.flac".into());
        let mut second = RawTrack::new("a-1", "Theo Parrish", "Falling Up, Again");
        second.bpm = Some(120.0);
        second.camelot_key = "6A".parse().ok();

        let mut enriched = EnrichedTrack::unenriched(second);
        enriched.genre = Some("Deep House".into());
        enriched.sources = vec!["discogs".into(), "lastfm".into()];

        let transition = TransitionScore {
            key_score: 0.8,
            tempo_sim: 0.8,
            coherence: 0.9,
            harmonic_score: 0.82,
            pop_novelty: 0.5,
            target_energy: 0.5,
            energy_penalty: 0.0,
            final_score: 0.674,
            reason: "Smooth BPM transition, Matches energy arc".into(),
        };
        Playlist {
            entries: vec![
                PlaylistEntry {
                    position: 1,
                    track: EnrichedTrack::unenriched(first),
                    transition: None,
                },
                PlaylistEntry {
                    position: 2,
                    track: enriched,
                    transition: Some(transition),
                },
            ],
            target_length: 3,
            shortfall: 1,
            diagnostics: Vec::new(),
        }
    }

    /// Minimal RFC 4180 reader for checking our own output.
    fn parse_csv(text: &str) -> Vec<Vec<String>> {
        let mut rows = Vec::new();
        let mut row = Vec::new();
        let mut field = String::new();
        let mut quoted = false;
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match (c, quoted) {
                ('"', true) if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                ('"', _) => quoted = !quoted,
                (',', false) => row.push(std::mem::take(&mut field)),
                ('\r', false) => {}
                ('\n', false) => {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                (c, _) => field.push(c),
            }
        }
        rows
    }

    #[test]
    fn test_json_keeps_order_and_positions() {
        let json = to_json(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["track_count"], 2);
        assert_eq!(value["shortfall"], 1);
        let tracks = value["tracks"].as_array().unwrap();
        assert_eq!(tracks[0]["id"], "b-2");
        assert_eq!(tracks[0]["position"], 1);
        assert!(tracks[0]["transition"].is_null());
        assert_eq!(tracks[1]["id"], "a-1");
        assert_eq!(tracks[1]["genre"], "Deep House");
        assert_eq!(tracks[1]["transition"]["final_score"], 0.674);
    }

    #[test]
    fn test_m3u_layout() {
        let m3u = to_m3u(&sample(), "friday");
        let lines: Vec<&str> = m3u.lines().collect();
        assert_eq!(
            lines,
            vec![
                "#EXTM3U",
                "#PLAYLIST:friday",
                "#EXTINF:421,Moodymann - Shades of \"Jae\"",
                "/music/moodymann/shades.flac",
                "#EXTINF:-1,Theo Parrish - Falling Up, Again",
                "a-1",
            ]
        );
    }

    #[test]
    fn test_m3u_line_breaks_stay_inside_entry() {
        let mut playlist = sample();
        playlist.entries[0].track.track.artist = "Moody\nmann".into();
        playlist.entries[0].track.track.title = "Shades\r\nof Jae".into();
        let m3u = to_m3u(&playlist, "late\nnight");
        let lines: Vec<&str> = m3u.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[1], "#PLAYLIST:late night");
        assert_eq!(lines[2], "#EXTINF:421,Moody mann - Shades  of Jae");
        assert_eq!(lines[3], "/music/moodymann/shades.flac");
    }

    #[test]
    fn test_csv_quotes_and_order() {
        let rows = parse_csv(&to_csv(&sample()));
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].len(), CSV_HEADER.len());
        assert_eq!(rows[0][0], "position");
        assert_eq!(rows[1][1], "b-2");
        assert_eq!(rows[1][3], "Shades of \"Jae\"");
        assert_eq!(rows[1][5], "5A");
        assert_eq!(rows[2][1], "a-1");
        assert_eq!(rows[2][3], "Falling Up, Again");
        assert_eq!(rows[2][15], "discogs;lastfm");
        assert_eq!(rows[2][17], "0.6740");
        assert!(rows.iter().all(|r| r.len() == CSV_HEADER.len()));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("JSON".parse::<ExportFormat>(), Ok(ExportFormat::Json));
        assert_eq!("m3u8".parse::<ExportFormat>(), Ok(ExportFormat::M3u));
        assert_eq!("csv".parse::<ExportFormat>(), Ok(ExportFormat::Csv));
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
