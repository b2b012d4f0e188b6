use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::energy::{ArcShape, DEFAULT_FLAT_BASELINE};

/// Allowed deviation of a weight table's sum from 1.0.
pub const WEIGHT_EPSILON: f64 = 1e-3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{what} weights must sum to 1.0 (got {sum:.4})")]
    WeightSum { what: &'static str, sum: f64 },

    #[error("{what} weight {name:?} must be in [0, 1] (got {value})")]
    WeightRange {
        what: &'static str,
        name: String,
        value: f64,
    },

    #[error("no weight configured for source {0:?}")]
    MissingWeight(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn check_unit(what: &'static str, name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::WeightRange {
            what,
            name: name.to_string(),
            value,
        })
    }
}

fn check_sum(what: &'static str, sum: f64) -> Result<(), ConfigError> {
    if (sum - 1.0).abs() <= WEIGHT_EPSILON {
        Ok(())
    } else {
        Err(ConfigError::WeightSum { what, sum })
    }
}

/// Trust weight per metadata source. Sums to 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceWeights {
    weights: BTreeMap<String, f64>,
}

impl SourceWeights {
    pub fn new<I, S>(weights: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let weights: BTreeMap<String, f64> =
            weights.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for (name, &w) in &weights {
            check_unit("source", name, w)?;
        }
        check_sum("source", weights.values().sum())?;
        Ok(Self { weights })
    }

    pub fn get(&self, source: &str) -> Option<f64> {
        self.weights.get(source).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

/// Weights of the four similarity terms in the coherence score. Sums to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoherenceWeights {
    bpm: f64,
    key: f64,
    valence: f64,
    energy: f64,
}

impl CoherenceWeights {
    pub fn new(bpm: f64, key: f64, valence: f64, energy: f64) -> Result<Self, ConfigError> {
        for (name, w) in [("bpm", bpm), ("key", key), ("valence", valence), ("energy", energy)] {
            check_unit("coherence", name, w)?;
        }
        check_sum("coherence", bpm + key + valence + energy)?;
        Ok(Self {
            bpm,
            key,
            valence,
            energy,
        })
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }
    pub fn key(&self) -> f64 {
        self.key
    }
    pub fn valence(&self) -> f64 {
        self.valence
    }
    pub fn energy(&self) -> f64 {
        self.energy
    }
}

impl Default for CoherenceWeights {
    fn default() -> Self {
        Self {
            bpm: 0.25,
            key: 0.30,
            valence: 0.25,
            energy: 0.20,
        }
    }
}

/// Playlist construction settings as written in the config file or given on
/// the command line. Turn into a [`PlaylistConfig`] to use them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaylistOptions {
    pub target_bpm: f64,
    pub target_length: usize,
    pub lambda_popularity: f64,
    pub energy_arc: ArcShape,
    pub max_bpm_delta: f64,
    pub min_coherence_threshold: f64,
    /// Energy level used by the `flat` arc.
    pub flat_baseline: f64,
    /// Force this track first when it survives the prefilter.
    pub seed_track_id: Option<String>,
    pub exclude_ids: Vec<String>,
    /// Keep only tracks whose fused genre matches one of these (case-insensitive).
    pub genre_filter: Vec<String>,
    /// Inclusive year bounds.
    pub year_range: Option<(i32, i32)>,
}

impl Default for PlaylistOptions {
    fn default() -> Self {
        Self {
            target_bpm: 124.0,
            target_length: 30,
            lambda_popularity: 0.4,
            energy_arc: ArcShape::Progressive,
            max_bpm_delta: 10.0,
            min_coherence_threshold: 0.6,
            flat_baseline: DEFAULT_FLAT_BASELINE,
            seed_track_id: None,
            exclude_ids: Vec::new(),
            genre_filter: Vec::new(),
            year_range: None,
        }
    }
}

fn invalid<T>(field: &'static str, reason: String) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid { field, reason })
}

/// Validated, immutable playlist settings.
#[derive(Debug, Clone)]
pub struct PlaylistConfig {
    options: PlaylistOptions,
}

impl PlaylistConfig {
    pub fn new(options: PlaylistOptions) -> Result<Self, ConfigError> {
        if options.target_length == 0 {
            return invalid("target_length", "must be greater than 0".into());
        }
        if !(options.target_bpm.is_finite() && options.target_bpm > 0.0) {
            return invalid("target_bpm", format!("must be positive (got {})", options.target_bpm));
        }
        if !(options.max_bpm_delta.is_finite() && options.max_bpm_delta > 0.0) {
            return invalid(
                "max_bpm_delta",
                format!("must be positive (got {})", options.max_bpm_delta),
            );
        }
        for (field, value) in [
            ("lambda_popularity", options.lambda_popularity),
            ("min_coherence_threshold", options.min_coherence_threshold),
            ("flat_baseline", options.flat_baseline),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(field, format!("must be in [0, 1] (got {value})"));
            }
        }
        if let Some((from, to)) = options.year_range {
            if from > to {
                return invalid("year_range", format!("{from} is after {to}"));
            }
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &PlaylistOptions {
        &self.options
    }
}

/// Raw `[weights]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WeightsSection {
    pub sources: BTreeMap<String, f64>,
    pub coherence: CoherenceSection,
}

impl Default for WeightsSection {
    fn default() -> Self {
        Self {
            sources: BTreeMap::from([
                ("discogs".to_string(), 0.40),
                ("lastfm".to_string(), 0.15),
                ("musicbrainz".to_string(), 0.30),
                ("spotify".to_string(), 0.15),
            ]),
            coherence: CoherenceSection::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CoherenceSection {
    pub bpm: f64,
    pub key: f64,
    pub valence: f64,
    pub energy: f64,
}

impl Default for CoherenceSection {
    fn default() -> Self {
        let w = CoherenceWeights::default();
        Self {
            bpm: w.bpm,
            key: w.key,
            valence: w.valence,
            energy: w.energy,
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Days a fetched record stays fresh.
    pub ttl_days: u64,
    /// Days a "not found" answer is remembered.
    pub negative_ttl_days: u64,
    /// Separate cache database (defaults to the main database).
    pub path: Option<PathBuf>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_days: 7,
            negative_ttl_days: 7,
            path: None,
        }
    }
}

impl CacheSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days * 86_400)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_days * 86_400)
    }
}

/// `[sources.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub enabled: bool,
    pub timeout_ms: u64,
    /// Maximum simultaneous requests to this provider.
    pub concurrency: usize,
    /// Minimum spacing between requests. Providers pick a default when unset.
    pub min_interval_ms: Option<u64>,
    pub token: Option<String>,
    pub api_key: Option<String>,
    /// OAuth client credentials, for providers that use them.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 10_000,
            concurrency: 2,
            min_interval_ms: None,
            token: None,
            api_key: None,
            client_id: None,
            client_secret: None,
        }
    }
}

impl SourceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Application configuration loaded from TOML config file.
/// Every section has defaults, so the file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Tracks enriched concurrently.
    pub batch_size: usize,
    pub weights: WeightsSection,
    pub playlist: PlaylistOptions,
    pub cache: CacheSection,
    pub sources: BTreeMap<String, SourceSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            batch_size: 16,
            weights: WeightsSection::default(),
            playlist: PlaylistOptions::default(),
            cache: CacheSection::default(),
            sources: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load config from `path`, or from `~/.config/setflow/config.toml` when
    /// no path is given. A missing default file means defaults; a file that
    /// exists but can't be read or parsed is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::config_path() {
                Some(p) if p.exists() => p,
                _ => {
                    log::debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn source_weights(&self) -> Result<SourceWeights, ConfigError> {
        SourceWeights::new(self.weights.sources.clone())
    }

    pub fn coherence_weights(&self) -> Result<CoherenceWeights, ConfigError> {
        let c = &self.weights.coherence;
        CoherenceWeights::new(c.bpm, c.key, c.valence, c.energy)
    }

    pub fn playlist_config(&self) -> Result<PlaylistConfig, ConfigError> {
        PlaylistConfig::new(self.playlist.clone())
    }

    /// Validate every section up front.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source_weights()?;
        self.coherence_weights()?;
        self.playlist_config()?;
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be greater than 0".into(),
            });
        }
        for (name, settings) in &self.sources {
            if settings.concurrency == 0 {
                return Err(ConfigError::Invalid {
                    field: "sources.concurrency",
                    reason: format!("{name}: must be greater than 0"),
                });
            }
        }
        Ok(())
    }

    /// Settings for one source with credentials from the environment filled in.
    pub fn source(&self, name: &str) -> SourceSettings {
        let mut settings = self.sources.get(name).cloned().unwrap_or_default();
        let env_prefix = format!("SETFLOW_{}", name.to_uppercase());
        if settings.token.is_none() {
            settings.token = std::env::var(format!("{env_prefix}_TOKEN")).ok();
        }
        if settings.api_key.is_none() {
            settings.api_key = std::env::var(format!("{env_prefix}_API_KEY")).ok();
        }
        if settings.client_id.is_none() {
            settings.client_id = std::env::var(format!("{env_prefix}_CLIENT_ID")).ok();
        }
        if settings.client_secret.is_none() {
            settings.client_secret = std::env::var(format!("{env_prefix}_CLIENT_SECRET")).ok();
        }
        settings
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("setflow.db")
    } else {
        // Fallback: current directory
        PathBuf::from("setflow.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        let weights = config.source_weights().unwrap();
        assert_eq!(weights.get("discogs"), Some(0.40));
        assert_eq!(weights.get("spotify"), Some(0.15));
        assert_eq!(weights.get("deezer"), None);
    }

    #[test]
    fn test_source_weights_sum() {
        assert!(SourceWeights::new([("a", 0.5), ("b", 0.5)]).is_ok());
        assert!(SourceWeights::new([("a", 0.5), ("b", 0.5004)]).is_ok());
        let err = SourceWeights::new([("a", 0.5), ("b", 0.4)]).unwrap_err();
        assert!(matches!(err, ConfigError::WeightSum { .. }));
        let err = SourceWeights::new([("a", 1.5), ("b", -0.5)]).unwrap_err();
        assert!(matches!(err, ConfigError::WeightRange { .. }));
        assert!(SourceWeights::new(Vec::<(String, f64)>::new()).is_err());
    }

    #[test]
    fn test_coherence_weights_sum() {
        assert!(CoherenceWeights::new(0.25, 0.30, 0.25, 0.20).is_ok());
        assert!(CoherenceWeights::new(0.25, 0.30, 0.25, 0.30).is_err());
    }

    #[test]
    fn test_playlist_config_validation() {
        let ok = PlaylistOptions::default();
        assert!(PlaylistConfig::new(ok.clone()).is_ok());

        let bad = PlaylistOptions {
            target_length: 0,
            ..ok.clone()
        };
        assert!(matches!(
            PlaylistConfig::new(bad),
            Err(ConfigError::Invalid {
                field: "target_length",
                ..
            })
        ));

        let bad = PlaylistOptions {
            lambda_popularity: 1.2,
            ..ok.clone()
        };
        assert!(PlaylistConfig::new(bad).is_err());

        let bad = PlaylistOptions {
            max_bpm_delta: 0.0,
            ..ok.clone()
        };
        assert!(PlaylistConfig::new(bad).is_err());

        let bad = PlaylistOptions {
            year_range: Some((2010, 2000)),
            ..ok
        };
        assert!(PlaylistConfig::new(bad).is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config = AppConfig::from_toml(
            r#"
            batch_size = 4

            [weights.sources]
            discogs = 0.6
            musicbrainz = 0.4

            [weights.coherence]
            bpm = 0.4
            key = 0.4
            valence = 0.1
            energy = 0.1

            [playlist]
            target_bpm = 128.0
            energy_arc = "peak"

            [cache]
            ttl_days = 1

            [sources.lastfm]
            enabled = false
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.playlist.energy_arc, ArcShape::Peak);
        assert_eq!(config.playlist.target_length, 30);
        assert_eq!(config.cache.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.cache.negative_ttl_days, 7);
        assert!(!config.source("lastfm").enabled);
        assert!(config.source("discogs").enabled);
        assert_eq!(config.coherence_weights().unwrap().bpm(), 0.4);
    }

    #[test]
    fn test_bad_weights_fail_validation() {
        let config = AppConfig::from_toml(
            r#"
            [weights.sources]
            discogs = 0.9
            lastfm = 0.9
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_explicit_path_errors() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/setflow.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_unparseable_errors() {
        let path = std::env::temp_dir().join(format!("setflow-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "this is = = not toml").unwrap();
        let err = AppConfig::load(Some(&path)).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
