use super::models::{CacheSourceCount, LibraryStats};
use super::{Database, Result};
use crate::cache::StoredEntry;
use crate::track::{EnrichedTrack, RawTrack};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Map a row of `RAW_COLUMNS` starting at `offset`.
fn raw_track_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<RawTrack> {
    let key: Option<String> = row.get(offset + 4)?;
    Ok(RawTrack {
        id: row.get(offset)?,
        title: row.get(offset + 1)?,
        artist: row.get(offset + 2)?,
        bpm: row.get(offset + 3)?,
        camelot_key: key.and_then(|k| k.parse().ok()),
        energy: row.get(offset + 5)?,
        duration_secs: row.get(offset + 6)?,
        file_path: row.get(offset + 7)?,
    })
}

const RAW_COLUMNS: &str =
    "t.id, t.title, t.artist, t.bpm, t.camelot_key, t.energy, t.duration_secs, t.file_path";

impl Database {
    /// Insert or update a raw track.
    pub fn upsert_track(&self, t: &RawTrack) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tracks (
                id, title, artist, bpm, camelot_key, energy, duration_secs, file_path,
                fingerprint, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                artist = excluded.artist,
                bpm = excluded.bpm,
                camelot_key = excluded.camelot_key,
                energy = excluded.energy,
                duration_secs = excluded.duration_secs,
                file_path = excluded.file_path,
                fingerprint = excluded.fingerprint,
                updated_at = datetime('now')
            ",
            params![
                t.id,
                t.title,
                t.artist,
                t.bpm,
                t.camelot_key.map(|k| k.to_string()),
                t.energy,
                t.duration_secs,
                t.file_path,
                t.fingerprint(),
            ],
        )?;
        Ok(())
    }

    /// Upsert many tracks in one transaction. Returns how many were written.
    pub fn import_tracks(&self, tracks: &[RawTrack]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for t in tracks {
            self.upsert_track(t)?;
        }
        tx.commit()?;
        Ok(tracks.len())
    }

    /// All raw tracks, ordered by id.
    pub fn get_tracks(&self) -> Result<Vec<RawTrack>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RAW_COLUMNS} FROM tracks t ORDER BY t.id"))?;
        let tracks = stmt
            .query_map([], |row| raw_track_from_row(row, 0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    /// Raw tracks with no enrichment row yet.
    pub fn get_unenriched_tracks(&self) -> Result<Vec<RawTrack>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RAW_COLUMNS}
             FROM tracks t
             LEFT JOIN enriched_tracks e ON e.track_id = t.id
             WHERE e.track_id IS NULL
             ORDER BY t.id"
        ))?;
        let tracks = stmt
            .query_map([], |row| raw_track_from_row(row, 0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    /// Store fused enrichment for a track that already exists in `tracks`.
    pub fn upsert_enriched(&self, e: &EnrichedTrack) -> Result<()> {
        self.conn.execute(
            "INSERT INTO enriched_tracks (
                track_id, genre, subgenres, mood, language, region,
                popularity, valence, year, genre_confidence, sources,
                enrichment_timestamp, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, datetime('now'))
            ON CONFLICT(track_id) DO UPDATE SET
                genre = excluded.genre,
                subgenres = excluded.subgenres,
                mood = excluded.mood,
                language = excluded.language,
                region = excluded.region,
                popularity = excluded.popularity,
                valence = excluded.valence,
                year = excluded.year,
                genre_confidence = excluded.genre_confidence,
                sources = excluded.sources,
                enrichment_timestamp = excluded.enrichment_timestamp,
                updated_at = datetime('now')
            ",
            params![
                e.track.id,
                e.genre,
                serde_json::to_string(&e.subgenres)?,
                e.mood,
                e.language,
                e.region,
                e.popularity,
                e.valence,
                e.year,
                e.genre_confidence,
                serde_json::to_string(&e.sources)?,
                e.enrichment_timestamp.map(|ts| ts.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Every track with whatever enrichment it has. Tracks never enriched come
    /// back with empty enrichment fields.
    pub fn get_enriched_tracks(&self) -> Result<Vec<EnrichedTrack>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RAW_COLUMNS},
                    e.track_id, e.genre, e.subgenres, e.mood, e.language, e.region,
                    e.popularity, e.valence, e.year, e.genre_confidence, e.sources,
                    e.enrichment_timestamp
             FROM tracks t
             LEFT JOIN enriched_tracks e ON e.track_id = t.id
             ORDER BY t.id"
        ))?;

        let tracks = stmt
            .query_map([], |row| {
                let raw = raw_track_from_row(row, 0)?;
                let enriched_id: Option<String> = row.get(8)?;
                if enriched_id.is_none() {
                    return Ok(EnrichedTrack::unenriched(raw));
                }
                let subgenres: String = row.get(10)?;
                let sources: String = row.get(18)?;
                let timestamp: Option<String> = row.get(19)?;
                Ok(EnrichedTrack {
                    track: raw,
                    genre: row.get(9)?,
                    subgenres: serde_json::from_str(&subgenres).unwrap_or_default(),
                    mood: row.get(11)?,
                    language: row.get(12)?,
                    region: row.get(13)?,
                    popularity: row.get(14)?,
                    valence: row.get(15)?,
                    year: row.get(16)?,
                    genre_confidence: row.get(17)?,
                    sources: serde_json::from_str(&sources).unwrap_or_default(),
                    enrichment_timestamp: timestamp.as_deref().and_then(parse_timestamp),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(tracks)
    }

    // --- enrichment cache ---

    pub fn get_cache_entry(&self, source: &str, fingerprint: &str) -> Result<Option<StoredEntry>> {
        let row: Option<(String, String, i64)> = self
            .conn
            .query_row(
                "SELECT payload, created_at, ttl_ms FROM enrichment_cache
                 WHERE source = ?1 AND fingerprint = ?2",
                params![source, fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(row.map(|(payload, created_at, ttl_ms)| {
            let created_at = parse_timestamp(&created_at).unwrap_or_else(|| {
                log::warn!("Bad cache timestamp {created_at:?} for {source}:{fingerprint}");
                DateTime::<Utc>::UNIX_EPOCH
            });
            StoredEntry {
                payload,
                created_at,
                ttl_ms,
            }
        }))
    }

    pub fn put_cache_entry(&self, source: &str, fingerprint: &str, entry: &StoredEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO enrichment_cache (source, fingerprint, payload, created_at, ttl_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source, fingerprint) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                ttl_ms = excluded.ttl_ms",
            params![
                source,
                fingerprint,
                entry.payload,
                entry.created_at.to_rfc3339(),
                entry.ttl_ms,
            ],
        )?;
        Ok(())
    }

    pub fn delete_cache_entry(&self, source: &str, fingerprint: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM enrichment_cache WHERE source = ?1 AND fingerprint = ?2",
            params![source, fingerprint],
        )?;
        Ok(())
    }

    /// Drop every cache entry. Returns the number removed.
    pub fn clear_cache(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM enrichment_cache", [])?)
    }

    pub fn cache_entry_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM enrichment_cache", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Entries per source, split into stored values and remembered misses.
    pub fn cache_counts_by_source(&self) -> Result<Vec<CacheSourceCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT source,
                    COUNT(*),
                    SUM(CASE WHEN json_extract(payload, '$.kind') = 'miss' THEN 1 ELSE 0 END)
             FROM enrichment_cache
             GROUP BY source
             ORDER BY source",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok(CacheSourceCount {
                    source: row.get(0)?,
                    entries: row.get(1)?,
                    misses: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Get library statistics.
    pub fn stats(&self) -> Result<LibraryStats> {
        let total_tracks: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;

        let enriched_tracks: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM enriched_tracks WHERE sources != '[]'",
            [],
            |row| row.get(0),
        )?;

        let missing_core: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tracks WHERE bpm IS NULL OR bpm <= 0 OR camelot_key IS NULL",
            [],
            |row| row.get(0),
        )?;

        let cache_entries = self.cache_entry_count()? as i64;

        let mut genre_stmt = self.conn.prepare(
            "SELECT genre, COUNT(*) FROM enriched_tracks
             WHERE genre IS NOT NULL
             GROUP BY genre
             ORDER BY COUNT(*) DESC, genre
             LIMIT 20",
        )?;
        let genres: Vec<(String, i64)> = genre_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut key_stmt = self.conn.prepare(
            "SELECT camelot_key, COUNT(*) FROM tracks
             WHERE camelot_key IS NOT NULL
             GROUP BY camelot_key
             ORDER BY COUNT(*) DESC, camelot_key",
        )?;
        let keys: Vec<(String, i64)> = key_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(LibraryStats {
            total_tracks,
            enriched_tracks,
            missing_core,
            cache_entries,
            genres,
            keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_track(id: &str) -> RawTrack {
        RawTrack {
            id: id.to_string(),
            title: "Strings of Life".to_string(),
            artist: "Rhythim Is Rhythim".to_string(),
            bpm: Some(124.0),
            camelot_key: "8A".parse().ok(),
            energy: Some(0.8),
            duration_secs: Some(372.0),
            file_path: Some(format!("/music/{id}.flac")),
        }
    }

    fn enriched(id: &str) -> EnrichedTrack {
        let mut e = EnrichedTrack::unenriched(test_track(id));
        e.genre = Some("Techno".to_string());
        e.subgenres = vec!["Detroit Techno".to_string()];
        e.popularity = Some(0.7);
        e.year = Some(1987);
        e.genre_confidence = 0.8;
        e.sources = vec!["discogs".to_string(), "musicbrainz".to_string()];
        e.enrichment_timestamp = parse_timestamp("2026-01-02T03:04:05+00:00");
        e
    }

    #[test]
    fn test_upsert_and_retrieve() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_track(&test_track("t1")).unwrap();
        let tracks = db.get_tracks().unwrap();
        assert_eq!(tracks, vec![test_track("t1")]);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let mut t = test_track("t1");
        db.upsert_track(&t).unwrap();
        t.bpm = Some(126.0);
        db.upsert_track(&t).unwrap();
        let tracks = db.get_tracks().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].bpm, Some(126.0));
    }

    #[test]
    fn test_enriched_round_trip() {
        let db = Database::open_in_memory().unwrap();
        db.import_tracks(&[test_track("t1"), test_track("t2")]).unwrap();
        db.upsert_enriched(&enriched("t1")).unwrap();

        let all = db.get_enriched_tracks().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], enriched("t1"));
        assert!(all[1].genre.is_none());
        assert!(all[1].sources.is_empty());

        let pending = db.get_unenriched_tracks().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t2");
    }

    #[test]
    fn test_enrichment_requires_known_track() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.upsert_enriched(&enriched("ghost")).is_err());
    }

    #[test]
    fn test_cache_entries() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_cache_entry("discogs", "a|b").unwrap().is_none());

        let entry = StoredEntry {
            payload: r#"{"kind":"miss"}"#.to_string(),
            created_at: parse_timestamp("2026-05-01T00:00:00+00:00").unwrap(),
            ttl_ms: 1000,
        };
        db.put_cache_entry("discogs", "a|b", &entry).unwrap();
        db.put_cache_entry("lastfm", "a|b", &StoredEntry {
            payload: r#"{"kind":"value","value":{}}"#.to_string(),
            ..entry.clone()
        })
        .unwrap();

        assert_eq!(db.get_cache_entry("discogs", "a|b").unwrap(), Some(entry));
        let counts = db.cache_counts_by_source().unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].source, "discogs");
        assert_eq!(counts[0].misses, 1);
        assert_eq!(counts[1].misses, 0);

        db.delete_cache_entry("discogs", "a|b").unwrap();
        assert_eq!(db.cache_entry_count().unwrap(), 1);
        assert_eq!(db.clear_cache().unwrap(), 1);
    }

    #[test]
    fn test_stats() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.total_tracks, 0);

        let mut keyless = test_track("t3");
        keyless.camelot_key = None;
        db.import_tracks(&[test_track("t1"), test_track("t2"), keyless])
            .unwrap();
        db.upsert_enriched(&enriched("t1")).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_tracks, 3);
        assert_eq!(stats.enriched_tracks, 1);
        assert_eq!(stats.missing_core, 1);
        assert_eq!(stats.genres, vec![("Techno".to_string(), 1)]);
        assert_eq!(stats.keys, vec![("8A".to_string(), 2)]);
    }
}
