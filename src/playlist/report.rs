//! Whole-set quality analysis of a finished playlist.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;

use super::Playlist;
use crate::coherence::CoherenceScorer;
use crate::energy::PEAK_POSITION;

/// Energy change between neighbours that counts as a jump.
const ENERGY_JUMP: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rating {
    Poor,
    Fair,
    Good,
    Excellent,
    Professional,
}

impl Rating {
    pub fn from_stats(avg: f64, min: f64, variance: f64) -> Self {
        if avg >= 0.8 && min >= 0.6 && variance <= 0.05 {
            Rating::Professional
        } else if avg >= 0.7 && min >= 0.5 && variance <= 0.1 {
            Rating::Excellent
        } else if avg >= 0.6 && min >= 0.4 {
            Rating::Good
        } else if avg >= 0.5 {
            Rating::Fair
        } else {
            Rating::Poor
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Rating::Poor => "POOR",
            Rating::Fair => "FAIR",
            Rating::Good => "GOOD",
            Rating::Excellent => "EXCELLENT",
            Rating::Professional => "PROFESSIONAL",
        })
    }
}

/// Coherence statistics over consecutive pairs. Absent for playlists under two tracks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionStats {
    pub scores: Vec<f64>,
    pub average: f64,
    pub minimum: f64,
    pub variance: f64,
    pub rating: Rating,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub track_count: usize,
    pub shortfall: usize,
    pub transitions: Option<TransitionStats>,
    /// 0.4 × peak placement + 0.6 × smoothness; 0.5 with under three energy values.
    pub energy_arc_quality: f64,
    pub bpm_range: Option<(f64, f64)>,
    /// Unique genres / track count.
    pub genre_diversity: f64,
    /// Camelot code to number of tracks.
    pub key_distribution: BTreeMap<String, usize>,
}

impl QualityReport {
    pub fn rating(&self) -> Option<Rating> {
        self.transitions.as_ref().map(|t| t.rating)
    }
}

fn energy_arc_quality(energies: &[f64]) -> f64 {
    if energies.len() < 3 {
        return 0.5;
    }
    let last = (energies.len() - 1) as f64;
    // First maximum
    let peak_index = energies
        .iter()
        .enumerate()
        .fold(0, |best, (i, &e)| if e > energies[best] { i } else { best });
    let peak_score = (1.0 - (peak_index as f64 / last - PEAK_POSITION).abs() * 2.0).max(0.0);

    let smoothness = energies
        .windows(2)
        .map(|w| if (w[1] - w[0]).abs() > ENERGY_JUMP { 0.5 } else { 1.0 })
        .sum::<f64>()
        / last;

    peak_score * 0.4 + smoothness * 0.6
}

fn transition_stats(scores: Vec<f64>) -> Option<TransitionStats> {
    if scores.is_empty() {
        return None;
    }
    let n = scores.len() as f64;
    let average = scores.iter().sum::<f64>() / n;
    let minimum = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let variance = scores.iter().map(|s| (s - average).powi(2)).sum::<f64>() / n;
    Some(TransitionStats {
        rating: Rating::from_stats(average, minimum, variance),
        scores,
        average,
        minimum,
        variance,
    })
}

/// Score every consecutive pair of `playlist` with `scorer` and summarise the set.
pub fn analyze(playlist: &Playlist, scorer: &CoherenceScorer) -> QualityReport {
    let tracks: Vec<_> = playlist.tracks().collect();

    let scores = tracks.windows(2).map(|w| scorer.score(w[0], w[1])).collect();
    let energies: Vec<f64> = tracks.iter().filter_map(|t| t.track.energy).collect();

    let bpm_range = tracks.iter().filter_map(|t| t.bpm()).fold(None, |range, bpm| match range {
        None => Some((bpm, bpm)),
        Some((lo, hi)) => Some((f64::min(lo, bpm), f64::max(hi, bpm))),
    });

    let genres: HashSet<String> = tracks
        .iter()
        .filter_map(|t| t.genre.as_deref())
        .map(str::to_lowercase)
        .collect();
    let genre_diversity = if tracks.is_empty() {
        0.0
    } else {
        genres.len() as f64 / tracks.len() as f64
    };

    let mut key_distribution = BTreeMap::new();
    for key in tracks.iter().filter_map(|t| t.key()) {
        *key_distribution.entry(key.to_string()).or_insert(0) += 1;
    }

    QualityReport {
        track_count: tracks.len(),
        shortfall: playlist.shortfall,
        transitions: transition_stats(scores),
        energy_arc_quality: energy_arc_quality(&energies),
        bpm_range,
        genre_diversity,
        key_distribution,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoherenceWeights;
    use crate::playlist::PlaylistEntry;
    use crate::track::{EnrichedTrack, RawTrack};

    fn playlist(specs: &[(f64, &str, f64, Option<&str>)]) -> Playlist {
        let entries = specs
            .iter()
            .enumerate()
            .map(|(i, &(bpm, key, energy, genre))| {
                let mut raw = RawTrack::new(format!("t{i}"), "a", "b");
                raw.bpm = Some(bpm);
                raw.camelot_key = key.parse().ok();
                raw.energy = Some(energy);
                let mut track = EnrichedTrack::unenriched(raw);
                track.genre = genre.map(str::to_string);
                PlaylistEntry {
                    position: i + 1,
                    track,
                    transition: None,
                }
            })
            .collect();
        Playlist {
            entries,
            target_length: specs.len(),
            shortfall: 0,
            diagnostics: Vec::new(),
        }
    }

    fn scorer() -> CoherenceScorer {
        CoherenceScorer::new(CoherenceWeights::default(), 10.0)
    }

    #[test]
    fn test_rating_thresholds() {
        assert_eq!(Rating::from_stats(0.85, 0.7, 0.01), Rating::Professional);
        assert_eq!(Rating::from_stats(0.85, 0.55, 0.01), Rating::Excellent);
        assert_eq!(Rating::from_stats(0.65, 0.45, 0.2), Rating::Good);
        assert_eq!(Rating::from_stats(0.55, 0.1, 0.2), Rating::Fair);
        assert_eq!(Rating::from_stats(0.3, 0.1, 0.0), Rating::Poor);
        assert_eq!(Rating::Professional.to_string(), "PROFESSIONAL");
    }

    #[test]
    fn test_smooth_set_is_professional() {
        let p = playlist(&[
            (124.0, "8A", 0.4, Some("House")),
            (124.0, "8A", 0.5, Some("house")),
            (125.0, "9A", 0.6, Some("Techno")),
            (125.0, "9A", 0.7, None),
            (126.0, "9A", 0.6, None),
        ]);
        let report = analyze(&p, &scorer());
        let stats = report.transitions.as_ref().unwrap();
        assert_eq!(stats.scores.len(), 4);
        assert_eq!(report.rating(), Some(Rating::Professional));
        assert_eq!(report.bpm_range, Some((124.0, 126.0)));
        assert!((report.genre_diversity - 2.0 / 5.0).abs() < 1e-9);
        assert_eq!(report.key_distribution.get("9A"), Some(&3));
        // Peak at index 3 of 4 (0.75); no jumps
        assert!((report.energy_arc_quality - (0.9 * 0.4 + 0.6)).abs() < 1e-9);
    }

    #[test]
    fn test_single_track_has_no_transition_stats() {
        let report = analyze(&playlist(&[(124.0, "8A", 0.5, None)]), &scorer());
        assert_eq!(report.track_count, 1);
        assert!(report.transitions.is_none());
        assert_eq!(report.rating(), None);
        assert_eq!(report.energy_arc_quality, 0.5);
    }

    #[test]
    fn test_energy_jumps_penalised() {
        // Peak at position 1.0 scores 0.4; both moves are jumps
        let q = energy_arc_quality(&[0.1, 0.5, 0.9]);
        assert!((q - (0.4 * 0.4 + 0.5 * 0.6)).abs() < 1e-9);
    }
}
