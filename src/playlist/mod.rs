//! Greedy playlist construction.
//!
//! Start from the track closest to the target tempo, then repeatedly append
//! the best next track among those within the BPM window and above the
//! coherence floor. When nothing qualifies the playlist ends short. The
//! thresholds are never relaxed.

pub mod export;
pub mod report;

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::camelot::{self, CamelotKey};
use crate::coherence::CoherenceScorer;
use crate::config::{CoherenceWeights, ConfigError, PlaylistConfig, PlaylistOptions};
use crate::energy::EnergyArcPlanner;
use crate::track::EnrichedTrack;

const HARMONIC_KEY_WEIGHT: f64 = 0.6;
const HARMONIC_TEMPO_WEIGHT: f64 = 0.2;
const HARMONIC_COHERENCE_WEIGHT: f64 = 0.2;
const FINAL_HARMONIC_WEIGHT: f64 = 0.7;
const FINAL_POPULARITY_WEIGHT: f64 = 0.2;
const FINAL_ENERGY_PENALTY: f64 = 0.1;

/// Scores behind one selection step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionScore {
    pub key_score: f64,
    pub tempo_sim: f64,
    pub coherence: f64,
    pub harmonic_score: f64,
    pub pop_novelty: f64,
    pub target_energy: f64,
    pub energy_penalty: f64,
    pub final_score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    /// 1-based
    pub position: usize,
    pub track: EnrichedTrack,
    /// How this track was reached from the previous one; `None` for the opener.
    pub transition: Option<TransitionScore>,
}

/// Things the builder noticed but didn't fail on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Track lacks bpm or key and was left out of the pool.
    MissingCoreFields { track_id: String, missing: Vec<String> },
    /// Track removed by an exclusion, genre or year filter, or as a duplicate id.
    Filtered { track_id: String, reason: String },
    /// Requested seed track wasn't in the pool; the closest-tempo track opened instead.
    SeedUnavailable { track_id: String },
    /// No candidate qualified after `after_position` tracks.
    Shortfall { after_position: usize, remaining_pool: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub entries: Vec<PlaylistEntry>,
    pub target_length: usize,
    /// `target_length - entries.len()`
    pub shortfall: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl Playlist {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &EnrichedTrack> {
        self.entries.iter().map(|e| &e.track)
    }

    pub fn transitions(&self) -> impl Iterator<Item = &TransitionScore> {
        self.entries.iter().filter_map(|e| e.transition.as_ref())
    }
}

/// A pool track with its core fields unpacked.
struct Candidate<'a> {
    track: &'a EnrichedTrack,
    bpm: f64,
    key: CamelotKey,
}

impl Candidate<'_> {
    fn id(&self) -> &str {
        self.track.id()
    }

    fn popularity(&self) -> f64 {
        self.track.popularity_or_neutral()
    }
}

/// `a` ranks above `b`: higher score, then higher popularity, then smaller id.
fn rank(a_score: f64, a: &Candidate<'_>, b_score: f64, b: &Candidate<'_>) -> Ordering {
    a_score
        .total_cmp(&b_score)
        .then_with(|| a.popularity().total_cmp(&b.popularity()))
        .then_with(|| b.id().cmp(a.id()))
}

fn selection_reason(score: &TransitionScore) -> String {
    let mut reasons = Vec::new();
    if score.harmonic_score > 0.8 {
        reasons.push("Excellent harmonic match");
    } else if score.key_score > 0.8 {
        reasons.push("Good key compatibility");
    }
    if score.tempo_sim > 0.9 {
        reasons.push("Perfect tempo match");
    } else if score.tempo_sim > 0.7 {
        reasons.push("Smooth BPM transition");
    }
    if score.coherence > 0.8 {
        reasons.push("High coherence");
    }
    if score.energy_penalty < 0.1 {
        reasons.push("Matches energy arc");
    }
    if reasons.is_empty() {
        "Selected by score".to_string()
    } else {
        reasons.join(", ")
    }
}

pub struct PlaylistBuilder {
    config: PlaylistConfig,
    scorer: CoherenceScorer,
    planner: EnergyArcPlanner,
}

impl PlaylistBuilder {
    pub fn new(config: PlaylistConfig, weights: CoherenceWeights) -> Self {
        let opts = config.options();
        let scorer = CoherenceScorer::new(weights, opts.max_bpm_delta);
        let planner = EnergyArcPlanner::new(opts.energy_arc).with_flat_baseline(opts.flat_baseline);
        Self {
            config,
            scorer,
            planner,
        }
    }

    /// Validate `options` and build.
    pub fn from_options(options: PlaylistOptions, weights: CoherenceWeights) -> Result<Self, ConfigError> {
        Ok(Self::new(PlaylistConfig::new(options)?, weights))
    }

    pub fn scorer(&self) -> &CoherenceScorer {
        &self.scorer
    }

    fn options(&self) -> &PlaylistOptions {
        self.config.options()
    }

    /// Split the input into candidates and diagnostics for the rest.
    fn prefilter<'a>(&self, tracks: &'a [EnrichedTrack], diagnostics: &mut Vec<Diagnostic>) -> Vec<Candidate<'a>> {
        let opts = self.options();
        let excluded: HashSet<&str> = opts.exclude_ids.iter().map(String::as_str).collect();
        let genres: Vec<String> = opts.genre_filter.iter().map(|g| g.trim().to_lowercase()).collect();
        let mut seen = HashSet::new();
        let mut pool = Vec::with_capacity(tracks.len());

        for track in tracks {
            let id = track.id().to_string();
            let filtered = |reason: String| Diagnostic::Filtered {
                track_id: id.clone(),
                reason,
            };

            let (bpm, key) = match (track.bpm(), track.key()) {
                (Some(bpm), Some(key)) => (bpm, key),
                (bpm, key) => {
                    let mut missing = Vec::new();
                    if bpm.is_none() {
                        missing.push("bpm".to_string());
                    }
                    if key.is_none() {
                        missing.push("key".to_string());
                    }
                    diagnostics.push(Diagnostic::MissingCoreFields {
                        track_id: id.clone(),
                        missing,
                    });
                    continue;
                }
            };
            if !seen.insert(track.id()) {
                diagnostics.push(filtered("duplicate id".into()));
                continue;
            }
            if excluded.contains(track.id()) {
                diagnostics.push(filtered("excluded".into()));
                continue;
            }
            if !genres.is_empty() {
                let genre = track.genre.as_deref().map(|g| g.trim().to_lowercase());
                if !genre.is_some_and(|g| genres.contains(&g)) {
                    diagnostics.push(filtered(format!(
                        "genre {:?} not in filter",
                        track.genre.as_deref().unwrap_or("unknown")
                    )));
                    continue;
                }
            }
            if let Some((from, to)) = opts.year_range {
                if !track.year.is_some_and(|y| (from..=to).contains(&y)) {
                    diagnostics.push(filtered(format!("year outside {from}-{to}")));
                    continue;
                }
            }
            pool.push(Candidate { track, bpm, key });
        }

        let dropped = tracks.len() - pool.len();
        if dropped > 0 {
            log::info!("Prefilter kept {} of {} tracks", pool.len(), tracks.len());
        }
        pool
    }

    /// Index of the opening track: the seed if present, else closest to target BPM.
    fn pick_opener(&self, pool: &[Candidate<'_>], diagnostics: &mut Vec<Diagnostic>) -> Option<usize> {
        let opts = self.options();
        if let Some(seed) = &opts.seed_track_id {
            match pool.iter().position(|c| c.id() == seed) {
                Some(i) => return Some(i),
                None => {
                    log::warn!("Seed track {seed} is not eligible; opening by tempo");
                    diagnostics.push(Diagnostic::SeedUnavailable {
                        track_id: seed.clone(),
                    });
                }
            }
        }
        // Closest tempo ranks highest, hence the negated distance
        (0..pool.len()).max_by(|&a, &b| {
            let da = -(pool[a].bpm - opts.target_bpm).abs();
            let db = -(pool[b].bpm - opts.target_bpm).abs();
            rank(da, &pool[a], db, &pool[b])
        })
    }

    fn score_transition(&self, last: &Candidate<'_>, next: &Candidate<'_>, target_energy: f64) -> TransitionScore {
        let opts = self.options();
        let key_score = camelot::compat(last.key, next.key);
        let tempo_sim = 1.0 - (last.bpm - next.bpm).abs() / opts.max_bpm_delta;
        let coherence = self.scorer.score(last.track, next.track);
        let harmonic_score = HARMONIC_KEY_WEIGHT * key_score
            + HARMONIC_TEMPO_WEIGHT * tempo_sim
            + HARMONIC_COHERENCE_WEIGHT * coherence;

        let popularity = next.popularity();
        let lambda = opts.lambda_popularity;
        let pop_novelty = lambda * popularity + (1.0 - lambda) * (1.0 - popularity);
        let energy_penalty = (next.track.energy_or_neutral() - target_energy).abs();
        let final_score = harmonic_score * FINAL_HARMONIC_WEIGHT + pop_novelty * FINAL_POPULARITY_WEIGHT
            - energy_penalty * FINAL_ENERGY_PENALTY;

        let mut score = TransitionScore {
            key_score,
            tempo_sim,
            coherence,
            harmonic_score,
            pop_novelty,
            target_energy,
            energy_penalty,
            final_score,
            reason: String::new(),
        };
        score.reason = selection_reason(&score);
        score
    }

    /// Build a playlist from `tracks`. Never fails; a short result carries a
    /// shortfall and the reasons in `diagnostics`.
    pub fn build(&self, tracks: &[EnrichedTrack]) -> Playlist {
        let opts = self.options();
        let target_length = opts.target_length;
        let mut diagnostics = Vec::new();
        let mut pool = self.prefilter(tracks, &mut diagnostics);
        let mut entries: Vec<PlaylistEntry> = Vec::with_capacity(target_length);

        let Some(first) = self.pick_opener(&pool, &mut diagnostics) else {
            log::warn!("No eligible tracks; playlist is empty");
            return Playlist {
                entries,
                target_length,
                shortfall: target_length,
                diagnostics,
            };
        };
        let mut last = pool.swap_remove(first);
        log::debug!("Opening with {} at {:.1} BPM", last.id(), last.bpm);
        entries.push(PlaylistEntry {
            position: 1,
            track: last.track.clone(),
            transition: None,
        });

        while entries.len() < target_length {
            let position = (entries.len() as f64 / target_length as f64).clamp(0.0, 1.0);
            let target_energy = self.planner.target(position);

            let mut best: Option<(usize, TransitionScore)> = None;
            for (i, candidate) in pool.iter().enumerate() {
                if (candidate.bpm - last.bpm).abs() > opts.max_bpm_delta {
                    continue;
                }
                if self.scorer.score(last.track, candidate.track) < opts.min_coherence_threshold {
                    continue;
                }
                let score = self.score_transition(&last, candidate, target_energy);
                let better = match &best {
                    None => true,
                    Some((j, incumbent)) => {
                        rank(score.final_score, candidate, incumbent.final_score, &pool[*j]) == Ordering::Greater
                    }
                };
                if better {
                    best = Some((i, score));
                }
            }

            let Some((chosen, score)) = best else {
                log::warn!(
                    "No eligible candidate after {} of {} tracks ({} left in pool)",
                    entries.len(),
                    target_length,
                    pool.len()
                );
                diagnostics.push(Diagnostic::Shortfall {
                    after_position: entries.len(),
                    remaining_pool: pool.len(),
                });
                break;
            };

            let next = pool.swap_remove(chosen);
            log::debug!(
                "#{}: {} (score {:.3}, {})",
                entries.len() + 1,
                next.id(),
                score.final_score,
                score.reason
            );
            entries.push(PlaylistEntry {
                position: entries.len() + 1,
                track: next.track.clone(),
                transition: Some(score),
            });
            last = next;
        }

        Playlist {
            shortfall: target_length - entries.len(),
            entries,
            target_length,
            diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::ArcShape;
    use crate::track::RawTrack;

    fn track(id: &str, bpm: f64, key: &str, energy: f64, popularity: f64) -> EnrichedTrack {
        let mut raw = RawTrack::new(id, format!("Artist {id}"), format!("Title {id}"));
        raw.bpm = Some(bpm);
        raw.camelot_key = key.parse().ok();
        raw.energy = Some(energy);
        let mut t = EnrichedTrack::unenriched(raw);
        t.popularity = Some(popularity);
        t.valence = Some(0.5);
        t
    }

    fn options(target_length: usize) -> PlaylistOptions {
        PlaylistOptions {
            target_length,
            ..Default::default()
        }
    }

    fn builder(opts: PlaylistOptions) -> PlaylistBuilder {
        PlaylistBuilder::from_options(opts, CoherenceWeights::default()).unwrap()
    }

    fn ids(p: &Playlist) -> Vec<&str> {
        p.tracks().map(|t| t.id()).collect()
    }

    #[test]
    fn test_end_to_end_five_tracks() {
        let tracks = vec![
            track("a", 124.0, "8A", 0.5, 0.5),
            track("b", 125.0, "8A", 0.5, 0.5),
            track("c", 123.0, "9A", 0.5, 0.5),
            track("d", 125.5, "8B", 0.5, 0.5),
            track("e", 122.5, "2A", 0.5, 0.5),
        ];
        let opts = PlaylistOptions {
            target_length: 3,
            max_bpm_delta: 5.0,
            min_coherence_threshold: 0.5,
            target_bpm: 124.0,
            ..Default::default()
        };
        let key = |s: &str| s.parse::<CamelotKey>().unwrap();
        assert_eq!(camelot::compat(key("8A"), key("2A")), 0.0);
        assert_eq!(camelot::compat(key("8B"), key("2A")), 0.0);

        let playlist = builder(opts).build(&tracks);

        assert_eq!(ids(&playlist), vec!["a", "b", "d"]);
        assert_eq!(playlist.shortfall, 0);
        assert!(playlist.entries[0].transition.is_none());
        for (i, entry) in playlist.entries.iter().enumerate() {
            assert_eq!(entry.position, i + 1);
        }
        for t in playlist.transitions() {
            assert!(t.coherence >= 0.5);
        }
    }

    #[test]
    fn test_clashing_key_breaks_threshold() {
        // Key-heavy weights: a 0.0 key match can't reach the floor
        let weights = CoherenceWeights::new(0.1, 0.6, 0.15, 0.15).unwrap();
        let opts = PlaylistOptions {
            target_length: 2,
            max_bpm_delta: 5.0,
            min_coherence_threshold: 0.5,
            ..Default::default()
        };
        let builder = PlaylistBuilder::new(PlaylistConfig::new(opts).unwrap(), weights);
        let playlist = builder.build(&[track("a", 124.0, "8A", 0.5, 0.5), track("e", 124.0, "2A", 0.5, 0.5)]);
        assert_eq!(ids(&playlist), vec!["a"]);
        assert_eq!(playlist.shortfall, 1);
        assert!(matches!(
            playlist.diagnostics.last(),
            Some(Diagnostic::Shortfall { after_position: 1, remaining_pool: 1 })
        ));
    }

    #[test]
    fn test_lambda_one_prefers_popular() {
        let tracks = vec![
            track("a", 124.0, "8A", 0.5, 0.5),
            track("low", 124.0, "8A", 0.5, 0.2),
            track("high", 124.0, "8A", 0.5, 0.9),
        ];
        let opts = PlaylistOptions {
            target_length: 2,
            lambda_popularity: 1.0,
            energy_arc: ArcShape::Flat,
            seed_track_id: Some("a".into()),
            ..Default::default()
        };
        assert_eq!(ids(&builder(opts).build(&tracks)), vec!["a", "high"]);
    }

    #[test]
    fn test_lambda_zero_prefers_novel() {
        let tracks = vec![
            track("a", 124.0, "8A", 0.5, 0.5),
            track("low", 124.0, "8A", 0.5, 0.2),
            track("high", 124.0, "8A", 0.5, 0.9),
        ];
        let opts = PlaylistOptions {
            target_length: 2,
            lambda_popularity: 0.0,
            energy_arc: ArcShape::Flat,
            seed_track_id: Some("a".into()),
            ..Default::default()
        };
        assert_eq!(ids(&builder(opts).build(&tracks)), vec!["a", "low"]);
    }

    #[test]
    fn test_exact_tie_breaks_by_id() {
        let tracks = vec![
            track("a", 124.0, "8A", 0.5, 0.5),
            track("z", 124.0, "8A", 0.5, 0.5),
            track("m", 124.0, "8A", 0.5, 0.5),
        ];
        let playlist = builder(options(3)).build(&tracks);
        assert_eq!(ids(&playlist), vec!["a", "m", "z"]);
    }

    #[test]
    fn test_shortfall_when_pool_too_small() {
        let tracks = vec![track("a", 124.0, "8A", 0.5, 0.5), track("b", 126.0, "9A", 0.6, 0.5)];
        let playlist = builder(options(10)).build(&tracks);
        assert_eq!(playlist.len(), 2);
        assert_eq!(playlist.shortfall, 8);
        assert_eq!(playlist.target_length, 10);
    }

    #[test]
    fn test_bpm_window_is_hard() {
        let tracks = vec![track("a", 124.0, "8A", 0.5, 0.5), track("far", 140.0, "8A", 0.5, 0.5)];
        let playlist = builder(options(2)).build(&tracks);
        assert_eq!(ids(&playlist), vec!["a"]);
    }

    #[test]
    fn test_missing_core_fields_reported() {
        let mut no_key = track("nokey", 124.0, "8A", 0.5, 0.5);
        no_key.track.camelot_key = None;
        let mut no_bpm = track("nobpm", 124.0, "8A", 0.5, 0.5);
        no_bpm.track.bpm = None;
        let playlist = builder(options(3)).build(&[no_key, no_bpm, track("ok", 120.0, "1A", 0.5, 0.5)]);

        assert_eq!(ids(&playlist), vec!["ok"]);
        let missing: Vec<_> = playlist
            .diagnostics
            .iter()
            .filter_map(|d| match d {
                Diagnostic::MissingCoreFields { track_id, missing } => Some((track_id.as_str(), missing.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            missing,
            vec![("nokey", vec!["key".to_string()]), ("nobpm", vec!["bpm".to_string()])]
        );
    }

    #[test]
    fn test_empty_input() {
        let playlist = builder(options(5)).build(&[]);
        assert!(playlist.is_empty());
        assert_eq!(playlist.shortfall, 5);
    }

    #[test]
    fn test_filters_and_seed() {
        let mut house = track("h1", 124.0, "8A", 0.5, 0.5);
        house.genre = Some("House".into());
        house.year = Some(1995);
        let mut house2 = track("h2", 126.0, "8A", 0.5, 0.5);
        house2.genre = Some("house".into());
        house2.year = Some(2015);
        let mut techno = track("t1", 124.0, "8A", 0.5, 0.5);
        techno.genre = Some("Techno".into());
        techno.year = Some(1995);

        let opts = PlaylistOptions {
            target_length: 3,
            genre_filter: vec!["HOUSE".into()],
            year_range: Some((1990, 1999)),
            seed_track_id: Some("missing".into()),
            ..Default::default()
        };
        let playlist = builder(opts).build(&[house, house2, techno]);
        assert_eq!(ids(&playlist), vec!["h1"]);
        assert!(playlist
            .diagnostics
            .contains(&Diagnostic::SeedUnavailable { track_id: "missing".into() }));
        let filtered = playlist
            .diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::Filtered { .. }))
            .count();
        assert_eq!(filtered, 2);
    }

    #[test]
    fn test_exclusions_and_duplicates() {
        let tracks = vec![
            track("a", 124.0, "8A", 0.5, 0.5),
            track("a", 124.0, "8A", 0.5, 0.5),
            track("b", 124.0, "8A", 0.5, 0.5),
        ];
        let opts = PlaylistOptions {
            target_length: 3,
            exclude_ids: vec!["b".into()],
            ..Default::default()
        };
        let playlist = builder(opts).build(&tracks);
        assert_eq!(ids(&playlist), vec!["a"]);
        assert_eq!(playlist.diagnostics.len(), 3);
    }

    #[test]
    fn test_energy_arc_steers_choice() {
        let tracks = vec![
            track("a", 124.0, "8A", 0.3, 0.5),
            track("calm", 124.0, "8A", 0.35, 0.5),
            track("peak", 124.0, "8A", 0.9, 0.5),
        ];
        let opts = PlaylistOptions {
            target_length: 3,
            energy_arc: ArcShape::Progressive,
            seed_track_id: Some("a".into()),
            ..Default::default()
        };
        let playlist = builder(opts).build(&tracks);
        // Position 1/3 targets 0.5 energy; coherence to "a" also favours "calm"
        assert_eq!(ids(&playlist)[1], "calm");
    }

    #[test]
    fn test_deterministic() {
        let tracks: Vec<EnrichedTrack> = (0..20)
            .map(|i| {
                let key = format!("{}{}", i % 12 + 1, if i % 2 == 0 { "A" } else { "B" });
                track(&format!("t{i:02}"), 120.0 + (i % 7) as f64, &key, (i % 10) as f64 / 10.0, (i % 5) as f64 / 5.0)
            })
            .collect();
        let b = builder(options(8));
        assert_eq!(b.build(&tracks), b.build(&tracks));
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(PlaylistBuilder::from_options(options(0), CoherenceWeights::default()).is_err());
    }
}
