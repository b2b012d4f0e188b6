/// Library statistics for the `stats` command.
#[derive(Debug, Clone, Default)]
pub struct LibraryStats {
    pub total_tracks: i64,
    pub enriched_tracks: i64,
    /// Tracks missing bpm or key; never eligible for a playlist.
    pub missing_core: i64,
    pub cache_entries: i64,
    pub genres: Vec<(String, i64)>,
    pub keys: Vec<(String, i64)>,
}

/// Cache entry counts per metadata source.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSourceCount {
    pub source: String,
    pub entries: i64,
    pub misses: i64,
}
