pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

const SCHEMA_VERSION: i32 = 1;

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL lets the cache connection and the main connection share the file
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: imported tracks, fused enrichment, source cache
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tracks (
                id              TEXT PRIMARY KEY,
                title           TEXT NOT NULL,
                artist          TEXT NOT NULL,
                bpm             REAL,
                camelot_key     TEXT,
                energy          REAL,
                duration_secs   REAL,
                file_path       TEXT,
                fingerprint     TEXT NOT NULL,
                imported_at     TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_tracks_fingerprint ON tracks(fingerprint);

            CREATE TABLE IF NOT EXISTS enriched_tracks (
                track_id             TEXT PRIMARY KEY REFERENCES tracks(id) ON DELETE CASCADE,
                genre                TEXT,
                subgenres            TEXT NOT NULL DEFAULT '[]',
                mood                 TEXT,
                language             TEXT,
                region               TEXT,
                popularity           REAL,
                valence              REAL,
                year                 INTEGER,
                genre_confidence     REAL NOT NULL DEFAULT 0,
                sources              TEXT NOT NULL DEFAULT '[]',
                enrichment_timestamp TEXT,
                updated_at           TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_enriched_genre ON enriched_tracks(genre);

            CREATE TABLE IF NOT EXISTS enrichment_cache (
                source       TEXT NOT NULL,
                fingerprint  TEXT NOT NULL,
                payload      TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                ttl_ms       INTEGER NOT NULL,
                PRIMARY KEY (source, fingerprint)
            );
            ",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_sets_version_and_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let version: i32 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        db.migrate().unwrap();
    }

    #[test]
    fn test_newer_schema_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(db.migrate(), Err(DbError::Migration(_))));
    }
}
