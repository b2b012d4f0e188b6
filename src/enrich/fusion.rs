//! Field-by-field fusion of per-source records into one enriched track.
//!
//! Each record votes with `source weight × confidence`. Categorical fields take
//! the weighted plurality, numeric fields the weighted mean. Only records that
//! actually carry a field count toward that field, so a source that failed or
//! had nothing to say never dilutes the others.

use std::collections::BTreeMap;

use crate::config::SourceWeights;
use crate::track::{EnrichedTrack, EnrichmentRecord, RawTrack};

#[derive(Debug)]
struct Vote<K: Ord> {
    tallies: BTreeMap<K, f64>,
    mass: f64,
}

impl<K: Ord + Clone> Vote<K> {
    fn new() -> Self {
        Self {
            tallies: BTreeMap::new(),
            mass: 0.0,
        }
    }

    fn add(&mut self, key: K, weight: f64) {
        *self.tallies.entry(key).or_insert(0.0) += weight;
        self.mass += weight;
    }

    /// Highest tally; ties go to the smallest key. Share is 0 when all weight is 0.
    fn winner(&self) -> Option<(K, f64)> {
        let mut best: Option<(&K, f64)> = None;
        for (key, &tally) in &self.tallies {
            if best.is_none_or(|(_, b)| tally > b) {
                best = Some((key, tally));
            }
        }
        best.map(|(key, tally)| {
            let share = if self.mass > 0.0 { tally / self.mass } else { 0.0 };
            (key.clone(), share)
        })
    }

    /// Keys by descending tally, then ascending key.
    fn ranked(&self) -> Vec<K> {
        let mut entries: Vec<(&K, f64)> = self.tallies.iter().map(|(k, &t)| (k, t)).collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries.into_iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Case-insensitive vote over strings that remembers how each value was first spelled.
struct TextVote {
    vote: Vote<String>,
    spellings: BTreeMap<String, String>,
}

impl TextVote {
    fn new() -> Self {
        Self {
            vote: Vote::new(),
            spellings: BTreeMap::new(),
        }
    }

    fn add(&mut self, value: &str, weight: f64) {
        let display = value.trim();
        if display.is_empty() {
            return;
        }
        let key = display.to_lowercase();
        self.spellings
            .entry(key.clone())
            .or_insert_with(|| display.to_string());
        self.vote.add(key, weight);
    }

    fn spelled(&self, key: &str) -> String {
        self.spellings
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    fn winner(&self) -> Option<(String, f64)> {
        self.vote
            .winner()
            .map(|(key, share)| (self.spelled(&key), share))
    }

    fn ranked_except(&self, exclude: Option<&str>) -> Vec<String> {
        let exclude = exclude.map(str::to_lowercase);
        self.vote
            .ranked()
            .into_iter()
            .filter(|k| Some(k) != exclude.as_ref())
            .map(|k| self.spelled(&k))
            .collect()
    }
}

#[derive(Default)]
struct WeightedMean {
    weight: f64,
    weighted_sum: f64,
    plain_sum: f64,
    count: usize,
}

impl WeightedMean {
    fn add(&mut self, value: f64, weight: f64) {
        if !value.is_finite() {
            return;
        }
        self.weight += weight;
        self.weighted_sum += weight * value;
        self.plain_sum += value;
        self.count += 1;
    }

    /// Falls back to the plain mean when every contributor had zero weight.
    fn value(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else if self.weight > 0.0 {
            Some(self.weighted_sum / self.weight)
        } else {
            Some(self.plain_sum / self.count as f64)
        }
    }
}

/// Effective vote weight of one record.
pub fn record_weight(record: &EnrichmentRecord, weights: &SourceWeights) -> f64 {
    let confidence = if record.confidence.is_finite() {
        record.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    weights.get(&record.source).unwrap_or(0.0) * confidence
}

/// Fuse `records` onto `track`. The result depends only on the set of records
/// and the weights, not on the order records are given in.
pub fn fuse(track: RawTrack, records: &[EnrichmentRecord], weights: &SourceWeights) -> EnrichedTrack {
    let mut ordered: Vec<&EnrichmentRecord> = records.iter().collect();
    ordered.sort_by(|a, b| {
        a.source
            .cmp(&b.source)
            .then_with(|| a.confidence.total_cmp(&b.confidence))
            .then_with(|| a.fetched_at.cmp(&b.fetched_at))
    });

    let mut genre = TextVote::new();
    let mut subgenres = TextVote::new();
    let mut mood = TextVote::new();
    let mut language = TextVote::new();
    let mut region = TextVote::new();
    let mut year: Vote<i32> = Vote::new();
    let mut popularity = WeightedMean::default();
    let mut valence = WeightedMean::default();

    for record in &ordered {
        let w = record_weight(record, weights);
        let f = &record.fields;
        if let Some(g) = &f.genre {
            genre.add(g, w);
        }
        let mut seen = Vec::new();
        for s in &f.subgenres {
            let norm = s.trim().to_lowercase();
            if !seen.contains(&norm) {
                subgenres.add(s, w);
                seen.push(norm);
            }
        }
        if let Some(m) = &f.mood {
            mood.add(m, w);
        }
        if let Some(l) = &f.language {
            language.add(l, w);
        }
        if let Some(r) = &f.region {
            region.add(r, w);
        }
        if let Some(y) = f.year {
            year.add(y, w);
        }
        if let Some(p) = f.popularity {
            popularity.add(p.clamp(0.0, 1.0), w);
        }
        if let Some(v) = f.valence {
            valence.add(v.clamp(0.0, 1.0), w);
        }
    }

    let (genre_value, genre_confidence) = match genre.winner() {
        Some((g, share)) => (Some(g), share),
        None => (None, 0.0),
    };
    let subgenre_list = subgenres.ranked_except(genre_value.as_deref());

    let mut sources: Vec<String> = ordered.iter().map(|r| r.source.clone()).collect();
    sources.dedup();

    EnrichedTrack {
        track,
        subgenres: subgenre_list,
        genre: genre_value,
        mood: mood.winner().map(|(m, _)| m),
        language: language.winner().map(|(l, _)| l),
        region: region.winner().map(|(r, _)| r),
        popularity: popularity.value(),
        valence: valence.value(),
        year: year.winner().map(|(y, _)| y),
        genre_confidence,
        sources,
        enrichment_timestamp: ordered.iter().map(|r| r.fetched_at).max(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::EnrichmentFields;
    use chrono::{TimeZone, Utc};

    fn weights() -> SourceWeights {
        SourceWeights::new([("discogs", 0.5), ("lastfm", 0.2), ("musicbrainz", 0.3)]).unwrap()
    }

    fn record(source: &str, confidence: f64, fields: EnrichmentFields) -> EnrichmentRecord {
        EnrichmentRecord {
            source: source.to_string(),
            fields,
            confidence,
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn genre(g: &str) -> EnrichmentFields {
        EnrichmentFields {
            genre: Some(g.to_string()),
            ..Default::default()
        }
    }

    fn raw() -> RawTrack {
        RawTrack::new("t1", "Artist", "Title")
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_weighted_plurality() {
        let records = vec![
            record("discogs", 0.6, genre("House")),
            record("lastfm", 1.0, genre("Techno")),
            record("musicbrainz", 1.0, genre("Techno")),
        ];
        let fused = fuse(raw(), &records, &weights());
        // House 0.30 vs Techno 0.2 + 0.3 = 0.5
        assert_eq!(fused.genre.as_deref(), Some("Techno"));
        assert!(approx(fused.genre_confidence, 0.5 / 0.8));
    }

    #[test]
    fn test_missing_sources_do_not_dilute_confidence() {
        let records = vec![record("lastfm", 0.5, genre("Disco"))];
        let fused = fuse(raw(), &records, &weights());
        assert_eq!(fused.genre.as_deref(), Some("Disco"));
        assert!(approx(fused.genre_confidence, 1.0));
        assert_eq!(fused.sources, vec!["lastfm"]);
    }

    #[test]
    fn test_absent_fields_stay_unset() {
        let fused = fuse(raw(), &[], &weights());
        assert!(fused.genre.is_none());
        assert!(fused.popularity.is_none());
        assert!(fused.subgenres.is_empty());
        assert_eq!(fused.genre_confidence, 0.0);
        assert!(fused.enrichment_timestamp.is_none());

        let only_pop = EnrichmentFields {
            popularity: Some(0.4),
            ..Default::default()
        };
        let fused = fuse(raw(), &[record("lastfm", 1.0, only_pop)], &weights());
        assert!(fused.genre.is_none());
        assert!((fused.popularity.unwrap() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_numeric_weighted_mean() {
        let a = EnrichmentFields {
            popularity: Some(1.0),
            valence: Some(0.2),
            ..Default::default()
        };
        let b = EnrichmentFields {
            popularity: Some(0.0),
            ..Default::default()
        };
        let fused = fuse(
            raw(),
            &[record("discogs", 1.0, a), record("musicbrainz", 1.0, b)],
            &weights(),
        );
        assert!(approx(fused.popularity.unwrap(), 0.5 / 0.8));
        assert!(approx(fused.valence.unwrap(), 0.2));
    }

    #[test]
    fn test_order_independent() {
        let mut records = vec![
            record("discogs", 0.9, genre("Deep House")),
            record("lastfm", 0.7, genre("deep house")),
            record("musicbrainz", 0.3, genre("House")),
        ];
        records[0].fields.subgenres = vec!["Soulful".into(), "Jazzy".into()];
        records[1].fields.subgenres = vec!["jazzy".into()];
        records[1].fields.mood = Some("Warm".into());

        let forward = fuse(raw(), &records, &weights());
        records.reverse();
        let backward = fuse(raw(), &records, &weights());
        assert_eq!(forward, backward);
        assert_eq!(forward, fuse(raw(), &records, &weights()));

        // Spelling comes from discogs, the first source by name
        assert_eq!(forward.genre.as_deref(), Some("Deep House"));
        assert_eq!(forward.subgenres, vec!["Jazzy", "Soulful"]);
        assert_eq!(forward.mood.as_deref(), Some("Warm"));
    }

    #[test]
    fn test_tie_goes_to_smallest_value() {
        let w = SourceWeights::new([("a", 0.5), ("b", 0.5)]).unwrap();
        let records = vec![record("a", 1.0, genre("Techno")), record("b", 1.0, genre("Acid"))];
        let fused = fuse(raw(), &records, &w);
        assert_eq!(fused.genre.as_deref(), Some("Acid"));
        assert!(approx(fused.genre_confidence, 0.5));
    }

    #[test]
    fn test_zero_weight_contribution_is_present_but_unconfident() {
        let records = vec![
            record("discogs", 0.0, genre("Electro")),
            record("unknown-source", 1.0, EnrichmentFields {
                popularity: Some(0.9),
                ..Default::default()
            }),
        ];
        let fused = fuse(raw(), &records, &weights());
        assert_eq!(fused.genre.as_deref(), Some("Electro"));
        assert_eq!(fused.genre_confidence, 0.0);
        assert_eq!(fused.popularity, Some(0.9));
    }

    #[test]
    fn test_year_vote_and_timestamp() {
        let mut a = record("discogs", 1.0, EnrichmentFields {
            year: Some(1992),
            ..Default::default()
        });
        let b = record("musicbrainz", 1.0, EnrichmentFields {
            year: Some(1993),
            ..Default::default()
        });
        a.fetched_at = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let fused = fuse(raw(), &[a.clone(), b], &weights());
        assert_eq!(fused.year, Some(1992));
        assert_eq!(fused.enrichment_timestamp, Some(a.fetched_at));
        assert_eq!(fused.sources, vec!["discogs", "musicbrainz"]);
    }
}
