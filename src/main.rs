use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use setflow::cache::{CacheStore, SqliteBackend};
use setflow::camelot::{self, CamelotKey, Relation};
use setflow::config::AppConfig;
use setflow::db::Database;
use setflow::energy::ArcShape;
use setflow::enrich::{EnrichError, SourceFusionEngine, providers};
use setflow::playlist::export::{self, ExportFormat};
use setflow::playlist::{Diagnostic, PlaylistBuilder, report};
use setflow::track::{EnrichedTrack, RawTrack};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "setflow", version, about = "Harmonic DJ playlist builder with multi-source metadata enrichment")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Config file (defaults to ~/.config/setflow/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import tracks from a JSON array (id, title, artist, bpm, key, energy, ...)
    Import {
        /// JSON file exported from the DJ library
        file: PathBuf,
    },

    /// Fetch metadata for tracks from every configured source
    Enrich {
        /// Ignore cached answers and ask every source again
        #[arg(long)]
        refresh: bool,

        /// Re-enrich tracks that already have enrichment
        #[arg(long)]
        all: bool,

        /// Abandon the run after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Build a playlist from enriched tracks
    Build {
        /// Number of tracks
        #[arg(short = 'n', long)]
        length: Option<usize>,

        /// Target tempo for the opening track
        #[arg(long)]
        bpm: Option<f64>,

        /// Energy arc (progressive, peak, valley, flat)
        #[arg(long)]
        arc: Option<ArcShape>,

        /// Popularity bias: 1.0 favours popular tracks, 0.0 obscure ones
        #[arg(long)]
        lambda: Option<f64>,

        /// Largest BPM jump between consecutive tracks
        #[arg(long)]
        max_bpm_delta: Option<f64>,

        /// Minimum coherence for a transition
        #[arg(long)]
        min_coherence: Option<f64>,

        /// Track id to open with
        #[arg(long)]
        seed: Option<String>,

        /// Track ids to leave out (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Only these genres (comma-separated, case-insensitive)
        #[arg(long, value_delimiter = ',')]
        genre: Vec<String>,

        /// Year or year range (e.g., "1995" or "1990-1999")
        #[arg(long, value_parser = parse_years)]
        years: Option<(i32, i32)>,

        /// Output format
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Playlist name (M3U header)
        #[arg(long, default_value = export::DEFAULT_PLAYLIST_NAME)]
        name: String,
    },

    /// List keys that mix well with a given key
    Keys {
        /// Camelot (8A) or musical (Am, F#) key
        key: String,

        /// Minimum compatibility score
        #[arg(long, default_value = "0.5")]
        min: f64,
    },

    /// Inspect or clear the enrichment cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show library statistics
    Stats,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry counts per source
    Stats,
    /// Delete every cached answer
    Clear,
}

fn parse_years(s: &str) -> std::result::Result<(i32, i32), String> {
    let parse = |y: &str| {
        y.trim()
            .parse::<i32>()
            .map_err(|_| format!("invalid year {y:?}"))
    };
    match s.split_once('-') {
        Some((from, to)) => Ok((parse(from)?, parse(to)?)),
        None => {
            let year = parse(s)?;
            Ok((year, year))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    config.validate().context("Invalid configuration")?;

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(setflow::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = Database::open(&db_path).context("Failed to open database")?;

    match cli.command {
        Commands::Import { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let tracks: Vec<RawTrack> = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let imported = db.import_tracks(&tracks).context("Import failed")?;
            let missing = tracks
                .iter()
                .filter(|t| t.bpm.is_none() || t.camelot_key.is_none())
                .count();
            println!("Import complete: {imported} tracks ({missing} missing bpm or key)");
        }

        Commands::Enrich {
            refresh,
            all,
            timeout_secs,
        } => {
            let tracks = (if all || refresh {
                db.get_tracks()
            } else {
                db.get_unenriched_tracks()
            })
            .context("Failed to load tracks")?;

            if tracks.is_empty() {
                println!("Nothing to enrich.");
                return Ok(());
            }

            let registry = providers::build_registry(&config);
            if registry.is_empty() {
                anyhow::bail!(
                    "No metadata sources available. Enable one in config or set its credentials."
                );
            }

            let cache = open_cache(&config, &db_path)?;
            let engine = SourceFusionEngine::new(
                registry,
                config.source_weights().context("Invalid source weights")?,
                Arc::new(cache),
            )
            .context("Invalid source configuration")?
            .with_refresh(refresh);
            println!(
                "Enriching {} tracks from {}",
                tracks.len(),
                engine.source_names().join(", ")
            );

            let pb = ProgressBar::new(tracks.len() as u64);
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )
                .unwrap()
                .progress_chars("#>-"),
            );

            let mut stored = 0usize;
            let mut store_errors = 0usize;
            let on_done = |enriched: &EnrichedTrack| {
                // Persist as we go so a cancelled run keeps finished tracks
                match db.upsert_enriched(enriched) {
                    Ok(()) => stored += 1,
                    Err(e) => {
                        log::warn!("Failed to store {}: {e}", enriched.id());
                        store_errors += 1;
                    }
                }
                pb.set_message(enriched.track.title.clone());
                pb.inc(1);
            };

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            let outcome = runtime.block_on(async {
                let cancel = async {
                    match timeout_secs {
                        Some(secs) => tokio::select! {
                            _ = tokio::signal::ctrl_c() => {}
                            () = tokio::time::sleep(Duration::from_secs(secs)) => {
                                log::warn!("Enrichment timed out after {secs}s");
                            }
                        },
                        None => {
                            let _ = tokio::signal::ctrl_c().await;
                        }
                    }
                };
                engine
                    .enrich_all_until(&tracks, config.batch_size, on_done, cancel)
                    .await
            });
            pb.finish_and_clear();

            let stats = engine.cache().stats();
            match outcome {
                Ok(_) => println!(
                    "Enrichment complete: {stored} stored, {store_errors} errors ({} cache hits, {} fetches)",
                    stats.hits, stats.fetches
                ),
                Err(EnrichError::Cancelled) => println!(
                    "Enrichment cancelled: {stored} of {} stored. Re-run to continue; finished lookups are cached.",
                    tracks.len()
                ),
                Err(e) => return Err(e).context("Enrichment failed"),
            }
        }

        Commands::Build {
            length,
            bpm,
            arc,
            lambda,
            max_bpm_delta,
            min_coherence,
            seed,
            exclude,
            genre,
            years,
            format,
            output,
            name,
        } => {
            // CLI flags override the [playlist] config section
            let mut options = config.playlist.clone();
            if let Some(n) = length {
                options.target_length = n;
            }
            if let Some(b) = bpm {
                options.target_bpm = b;
            }
            if let Some(a) = arc {
                options.energy_arc = a;
            }
            if let Some(l) = lambda {
                options.lambda_popularity = l;
            }
            if let Some(d) = max_bpm_delta {
                options.max_bpm_delta = d;
            }
            if let Some(c) = min_coherence {
                options.min_coherence_threshold = c;
            }
            if seed.is_some() {
                options.seed_track_id = seed;
            }
            if !exclude.is_empty() {
                options.exclude_ids = exclude;
            }
            if !genre.is_empty() {
                options.genre_filter = genre;
            }
            if years.is_some() {
                options.year_range = years;
            }

            let builder = PlaylistBuilder::from_options(
                options,
                config.coherence_weights().context("Invalid coherence weights")?,
            )
            .context("Invalid playlist options")?;

            let tracks = db.get_enriched_tracks().context("Failed to load tracks")?;
            let playlist = builder.build(&tracks);
            let quality = report::analyze(&playlist, builder.scorer());
            let rendered = export::export(&playlist, format, &name).context("Export failed")?;

            // Keep stdout clean for the playlist itself
            let summary = |line: String| {
                if output.is_some() {
                    println!("{line}");
                } else {
                    eprintln!("{line}");
                }
            };

            match &output {
                Some(path) => std::fs::write(path, &rendered)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => print!("{rendered}"),
            }

            summary(format!(
                "Playlist: {} of {} tracks{}",
                playlist.len(),
                playlist.target_length,
                if playlist.shortfall > 0 {
                    format!(" (short by {})", playlist.shortfall)
                } else {
                    String::new()
                }
            ));
            if let Some(stats) = &quality.transitions {
                summary(format!(
                    "Coherence: avg {:.3}, min {:.3}, variance {:.4} ({})",
                    stats.average, stats.minimum, stats.variance, stats.rating
                ));
            }
            summary(format!(
                "Energy arc quality: {:.2} | Genre diversity: {:.2}",
                quality.energy_arc_quality, quality.genre_diversity
            ));
            if let Some((lo, hi)) = quality.bpm_range {
                summary(format!("BPM range: {lo:.1}-{hi:.1}"));
            }
            print_diagnostics(&playlist.diagnostics, &summary);
        }

        Commands::Keys { key, min } => {
            let key: CamelotKey = key.parse().context("Invalid key")?;
            let keys = camelot::compatible_keys(key, min);

            println!("Keys compatible with {key}:");
            println!();
            println!("{:<5} {:>5}  {}", "Key", "Score", "Relation");
            println!("{}", "-".repeat(32));
            for (other, score) in keys {
                println!(
                    "{:<5} {:>5.2}  {}",
                    other.to_string(),
                    score,
                    Relation::between(key, other).label()
                );
            }
        }

        Commands::Cache { action } => match action {
            CacheAction::Stats => {
                let counts = db
                    .cache_counts_by_source()
                    .context("Failed to read cache")?;
                if counts.is_empty() {
                    println!("Cache is empty.");
                    return Ok(());
                }
                println!("{:<15} {:>8} {:>8}", "Source", "Entries", "Misses");
                println!("{}", "-".repeat(33));
                for c in &counts {
                    println!("{:<15} {:>8} {:>8}", c.source, c.entries, c.misses);
                }
            }
            CacheAction::Clear => {
                let cache = open_cache(&config, &db_path)?;
                let removed = cache.backend().clear().context("Failed to clear cache")?;
                println!("Cleared {removed} cache entries");
            }
        },

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Library Statistics");
            println!("==================");
            println!("Total tracks:     {}", stats.total_tracks);
            println!("Enriched tracks:  {}", stats.enriched_tracks);
            println!("Missing bpm/key:  {}", stats.missing_core);
            println!("Cache entries:    {}", stats.cache_entries);
            println!();

            if !stats.genres.is_empty() {
                println!("Genres:");
                for (genre, count) in &stats.genres {
                    println!("  {:<30} {}", genre, count);
                }
                println!();
            }

            if !stats.keys.is_empty() {
                println!("Keys:");
                for (key, count) in &stats.keys {
                    println!("  {:<4} {}", key, count);
                }
            }
        }
    }

    Ok(())
}

/// Cache store over `[cache] path`, or the main database when unset.
fn open_cache(config: &AppConfig, db_path: &Path) -> Result<CacheStore<setflow::track::EnrichmentRecord>> {
    let path = config.cache.path.as_deref().unwrap_or(db_path);
    let backend = SqliteBackend::open(path)
        .with_context(|| format!("Failed to open cache at {}", path.display()))?;
    Ok(CacheStore::new(Arc::new(backend), config.cache.ttl())
        .with_negative_ttl(config.cache.negative_ttl()))
}

/// Print builder diagnostics, grouping the per-track ones.
fn print_diagnostics(diagnostics: &[Diagnostic], out: &dyn Fn(String)) {
    let mut missing = 0usize;
    let mut filtered = 0usize;
    for d in diagnostics {
        match d {
            Diagnostic::MissingCoreFields { track_id, missing: fields } => {
                log::info!("{track_id}: missing {}", fields.join(", "));
                missing += 1;
            }
            Diagnostic::Filtered { track_id, reason } => {
                log::info!("{track_id}: {reason}");
                filtered += 1;
            }
            Diagnostic::SeedUnavailable { track_id } => {
                out(format!("Seed track {track_id} not eligible; opened by tempo instead"));
            }
            Diagnostic::Shortfall {
                after_position,
                remaining_pool,
            } => {
                out(format!(
                    "No compatible candidate after track {after_position} ({remaining_pool} left in pool)"
                ));
            }
        }
    }
    if missing > 0 {
        out(format!("Skipped {missing} tracks missing bpm or key"));
    }
    if filtered > 0 {
        out(format!("Filtered out {filtered} tracks"));
    }
}
