//! Pairwise similarity between two enriched tracks.

use serde::Serialize;

use crate::camelot;
use crate::config::CoherenceWeights;
use crate::track::EnrichedTrack;

/// Per-term similarities behind a coherence score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoherenceBreakdown {
    pub bpm: f64,
    pub key: f64,
    pub valence: f64,
    pub energy: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CoherenceScorer {
    weights: CoherenceWeights,
    max_bpm_delta: f64,
}

impl CoherenceScorer {
    /// `max_bpm_delta` must be positive; it comes from a validated `PlaylistConfig`.
    pub fn new(weights: CoherenceWeights, max_bpm_delta: f64) -> Self {
        Self {
            weights,
            max_bpm_delta,
        }
    }

    pub fn score(&self, a: &EnrichedTrack, b: &EnrichedTrack) -> f64 {
        self.breakdown(a, b).overall
    }

    pub fn breakdown(&self, a: &EnrichedTrack, b: &EnrichedTrack) -> CoherenceBreakdown {
        let bpm = match (a.bpm(), b.bpm()) {
            (Some(x), Some(y)) => bpm_similarity(x, y, self.max_bpm_delta),
            _ => 0.0,
        };
        let key = match (a.key(), b.key()) {
            (Some(x), Some(y)) => camelot::compat(x, y),
            _ => 0.0,
        };
        let valence = unit_similarity(a.valence_or_neutral(), b.valence_or_neutral());
        let energy = unit_similarity(a.energy_or_neutral(), b.energy_or_neutral());

        let w = &self.weights;
        let overall = (w.bpm() * bpm + w.key() * key + w.valence() * valence + w.energy() * energy)
            .clamp(0.0, 1.0);

        CoherenceBreakdown {
            bpm,
            key,
            valence,
            energy,
            overall,
        }
    }
}

/// `1 - min(1, |a - b| / max_delta)`
pub fn bpm_similarity(a: f64, b: f64, max_delta: f64) -> f64 {
    1.0 - ((a - b).abs() / max_delta).min(1.0)
}

fn unit_similarity(a: f64, b: f64) -> f64 {
    1.0 - (a - b).abs()
}
