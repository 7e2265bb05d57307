//! tiercache CLI - Admin Command Line Interface
//!
//! Inspects and maintains a disk cache directory: read and write items,
//! run trims, clear the cache and reconcile orphaned files.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tiercache_common::{Config as CacheConfig, StorageMode};
use tiercache_disk::{DiskCache, free_disk_space};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tiercache-cli")]
#[command(about = "tiercache Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache directory, overrides the configuration
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Storage mode, overrides the configuration
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Inline threshold in bytes, overrides the configuration
    #[arg(long)]
    inline_threshold: Option<usize>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show item count, stored bytes and free space
    Stat,
    /// Print a value
    Get {
        key: String,
        /// Write the value to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the extended data (hex) instead of the value
        #[arg(long)]
        extended: bool,
    },
    /// Store a value
    Put {
        key: String,
        /// Value as a literal string
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        value: Option<String>,
        /// Read the value from a file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Extended data as a literal string
        #[arg(long)]
        extra: Option<String>,
    },
    /// Remove a key
    Rm { key: String },
    /// Trim the cache; without flags, applies the configured limits
    Trim {
        /// Keep at most this many items
        #[arg(long)]
        count: Option<u64>,
        /// Keep at most this many stored bytes
        #[arg(long)]
        cost: Option<u64>,
        /// Remove items not accessed within this many seconds
        #[arg(long)]
        age_secs: Option<u64>,
        /// Keep at least this many bytes free on the volume
        #[arg(long)]
        free_space: Option<u64>,
    },
    /// Remove every item
    Clear,
    /// Reconcile the catalog with the blob files
    Sweep,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    File,
    Inline,
    Mixed,
}

impl From<ModeArg> for StorageMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::File => Self::File,
            ModeArg::Inline => Self::Inline,
            ModeArg::Mixed => Self::Mixed,
        }
    }
}

/// Merge the configuration file, `TIERCACHE__*` variables and flags
fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }
    let mut cache_config: CacheConfig = builder
        .add_source(
            config::Environment::with_prefix("TIERCACHE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(path) = &args.path {
        cache_config.disk.path.clone_from(path);
    }
    if let Some(mode) = args.mode {
        cache_config.disk.mode = mode.into();
    }
    if let Some(threshold) = args.inline_threshold {
        cache_config.disk.inline_threshold = threshold;
    }
    // One-shot process, no background trimming
    cache_config.disk.auto_trim_interval_ms = 0;
    Ok(cache_config)
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cache_config = load_config(&args)?;
    debug!("Configuration: {:?}", cache_config.disk);

    let cache = DiskCache::open(cache_config.disk.clone())
        .with_context(|| format!("failed to open cache at {:?}", cache_config.disk.path))?;

    run(&cache, args.command)
}

fn run(cache: &DiskCache, command: Commands) -> Result<()> {
    match command {
        Commands::Stat => {
            let stat = serde_json::json!({
                "path": cache.path(),
                "mode": cache.storage().mode(),
                "inline_threshold": cache.storage().inline_threshold(),
                "count": cache.total_count()?,
                "bytes": cache.total_cost()?,
                "free_disk_space": free_disk_space(cache.path())?,
            });
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
        Commands::Get {
            key,
            output,
            extended,
        } => {
            let entry = cache
                .get(&key)?
                .with_context(|| format!("key not found: {key}"))?;
            if extended {
                println!("{}", entry.extended_data.map(hex::encode).unwrap_or_default());
            } else if let Some(output) = output {
                std::fs::write(&output, &entry.value)
                    .with_context(|| format!("failed to write {}", output.display()))?;
            } else {
                std::io::stdout().write_all(&entry.value)?;
            }
        }
        Commands::Put {
            key,
            value,
            file,
            extra,
        } => {
            let value = match (value, file) {
                (Some(value), _) => value.into_bytes(),
                (None, Some(file)) => std::fs::read(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?,
                (None, None) => anyhow::bail!("either --value or --file is required"),
            };
            cache.set_with_extended_data(&key, &value, extra.as_deref().map(str::as_bytes))?;
            info!("Stored {} ({} bytes)", key, value.len());
        }
        Commands::Rm { key } => {
            cache.remove(&key)?;
            info!("Removed {}", key);
        }
        Commands::Trim {
            count,
            cost,
            age_secs,
            free_space,
        } => {
            if count.is_none() && cost.is_none() && age_secs.is_none() && free_space.is_none() {
                cache.trim()?;
            } else {
                if let Some(cost) = cost {
                    cache.trim_to_cost(cost)?;
                }
                if let Some(count) = count {
                    cache.trim_to_count(count)?;
                }
                if let Some(age) = age_secs {
                    cache.trim_to_age(Duration::from_secs(age))?;
                }
                if let Some(floor) = free_space {
                    cache.trim_to_free_space(floor)?;
                }
            }
            println!(
                "{} items, {} bytes",
                cache.total_count()?,
                cache.total_cost()?
            );
        }
        Commands::Clear => {
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            cache.remove_all_with_progress(
                |removed, total| eprintln!("removed {removed}/{total}"),
                move |result| {
                    let _ = done_tx.send(result);
                },
            );
            done_rx
                .recv()
                .context("worker queue stopped before finishing")??;
            println!("Cleared {}", cache.path().display());
        }
        Commands::Sweep => {
            let report = cache.storage().sweep()?;
            println!(
                "{} rows without files, {} orphan files",
                report.missing_files, report.orphan_files
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tiercache.toml");
        std::fs::write(
            &file,
            "[disk]\npath = \"/from/file\"\nmode = \"file\"\ncount_limit = 10\n",
        )
        .unwrap();
        let file = file.to_str().unwrap();

        let config = load_config(&parse(&["tiercache-cli", "-c", file, "stat"])).unwrap();
        assert_eq!(config.disk.path, PathBuf::from("/from/file"));
        assert_eq!(config.disk.mode, StorageMode::File);
        assert_eq!(config.disk.count_limit, Some(10));
        assert_eq!(config.disk.auto_trim_interval_ms, 0);

        let config = load_config(&parse(&[
            "tiercache-cli",
            "-c",
            file,
            "--path",
            "/from/flag",
            "--mode",
            "inline",
            "stat",
        ]))
        .unwrap();
        assert_eq!(config.disk.path, PathBuf::from("/from/flag"));
        assert_eq!(config.disk.mode, StorageMode::Inline);
    }

    #[test]
    fn test_put_get_rm_clear() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let args = parse(&["tiercache-cli", "--path", path, "stat"]);
        let cache = DiskCache::open(load_config(&args).unwrap().disk).unwrap();

        run(
            &cache,
            parse(&["tiercache-cli", "put", "k", "--value", "hello", "--extra", "x"]).command,
        )
        .unwrap();
        let entry = cache.get("k").unwrap().unwrap();
        assert_eq!(entry.value, b"hello");
        assert_eq!(entry.extended_data.as_deref(), Some(&b"x"[..]));

        let out = dir.path().join("out.bin");
        run(
            &cache,
            parse(&["tiercache-cli", "get", "k", "-o", out.to_str().unwrap()]).command,
        )
        .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"hello");

        assert!(run(&cache, parse(&["tiercache-cli", "get", "missing"]).command).is_err());

        run(&cache, parse(&["tiercache-cli", "rm", "k"]).command).unwrap();
        assert!(!cache.contains("k").unwrap());

        cache.set("a", b"1").unwrap();
        run(&cache, parse(&["tiercache-cli", "clear"]).command).unwrap();
        assert_eq!(cache.total_count().unwrap(), 0);

        run(&cache, parse(&["tiercache-cli", "sweep"]).command).unwrap();
    }

    #[test]
    fn test_trim_command() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let args = parse(&["tiercache-cli", "--path", path, "stat"]);
        let cache = DiskCache::open(load_config(&args).unwrap().disk).unwrap();

        for i in 0..5 {
            cache.set(&format!("k{i}"), b"value").unwrap();
        }
        run(&cache, parse(&["tiercache-cli", "trim", "--count", "2"]).command).unwrap();
        assert_eq!(cache.total_count().unwrap(), 2);
    }

    #[test]
    fn test_put_requires_value() {
        assert!(Args::try_parse_from(["tiercache-cli", "put", "k"]).is_err());
    }
}
