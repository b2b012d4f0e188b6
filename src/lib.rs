pub mod cache;
pub mod camelot;
pub mod coherence;
pub mod config;
pub mod db;
pub mod energy;
pub mod enrich;
pub mod playlist;
pub mod track;

/// Application name for XDG paths
pub const APP_NAME: &str = "setflow";
