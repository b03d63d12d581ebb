//! Journaly - day-organised journaling core with live sync and a media cache
//!
//! Command-line access to the configuration and the local media cache.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use journaly::{
    cache::{DiskStorage, MediaCache, MediaKind},
    config::JournalyConfig,
    remote::HttpBlobSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "journaly")]
#[command(author = "Journaly Team")]
#[command(version)]
#[command(about = "Day-organised journaling core with live sync and a media cache")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "JOURNALY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run diagnostics
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },

    /// Inspect or fill the local media cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached files
    List,

    /// Check whether a file is cached
    Has {
        /// Cache filename, e.g. `1.jpg.jpg`
        filename: String,
    },

    /// Download a media URL into the cache
    Fetch {
        /// Remote media URL
        url: String,

        /// Media kind: images or audio
        #[arg(short, long, default_value = "images")]
        kind: MediaKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("journaly={}", log_level).into());
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => JournalyConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let path = JournalyConfig::default_path();
            if path.exists() {
                JournalyConfig::load(&path)?
            } else {
                JournalyConfig::default()
            }
        }
    };

    match cli.command {
        Commands::Doctor => {
            run_doctor(&config, cli.config.as_deref()).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
        Commands::Cache { command } => {
            run_cache(&config, command).await?;
        }
    }

    Ok(())
}

async fn open_cache(config: &JournalyConfig) -> Result<MediaCache> {
    let storage = DiskStorage::open(config.storage.cache_dir()).await?;
    let source = HttpBlobSource::new(&config.media)?;
    Ok(MediaCache::from_config(
        &config.media,
        Arc::new(storage),
        Arc::new(source),
    ))
}

async fn run_cache(config: &JournalyConfig, command: CacheCommands) -> Result<()> {
    let cache = open_cache(config).await?;
    match command {
        CacheCommands::List => {
            for name in cache.list().await? {
                println!("{}", name);
            }
        }
        CacheCommands::Has { filename } => {
            match cache.get(&filename).await {
                Some(handle) => println!("present: {}", handle.path.display()),
                None => println!("absent: {}", filename),
            }
        }
        CacheCommands::Fetch { url, kind } => {
            let handle = cache.ensure(&url, kind).await?;
            println!("{}", handle.path.display());
        }
    }
    Ok(())
}

async fn run_doctor(config: &JournalyConfig, explicit: Option<&std::path::Path>) -> Result<()> {
    println!("Journaly Doctor");
    println!();

    println!("Checking configuration...");
    let path = explicit
        .map(PathBuf::from)
        .unwrap_or_else(JournalyConfig::default_path);
    if path.exists() {
        println!("  ✓ Configuration file found: {}", path.display());
    } else {
        println!("  ℹ No configuration file found (using defaults)");
    }
    match config.validate() {
        Ok(()) => println!("  ✓ Configuration is valid"),
        Err(e) => println!("  ✗ {}", e),
    }

    println!();
    println!("Checking media cache...");
    let dir = config.storage.cache_dir();
    match DiskStorage::open(&dir).await {
        Ok(storage) => {
            let cache = MediaCache::from_config(
                &config.media,
                Arc::new(storage),
                Arc::new(HttpBlobSource::new(&config.media)?),
            );
            let files = cache.list().await?;
            println!("  ✓ Cache directory: {} ({} files)", dir.display(), files.len());
        }
        Err(e) => println!("  ✗ Cache directory {} unusable: {}", dir.display(), e),
    }

    println!();
    println!("Doctor check complete!");

    Ok(())
}

fn show_config(config: Option<&JournalyConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
