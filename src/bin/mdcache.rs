//! `mdcache`: administrative tool for the market data cache
//!
//! Reports are printed to stdout as JSON; logs go to stderr (`RUST_LOG`).

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use market_data_cache::{CacheConfig, CacheManager};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mdcache", version, about = "Inspect and maintain a market data cache")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Warm tier database, overriding the configuration
    #[arg(long, global = true)]
    warm_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show live entries of one source
    Inspect {
        #[arg(long)]
        source: String,
        /// Maximum number of entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete every expired entry
    ClearExpired,
    /// Delete every entry of one source
    Purge {
        #[arg(long)]
        source: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Show statistics and storage utilization
    Stats,
    /// Time synthetic writes and reads against both tiers
    Benchmark {
        #[arg(long, default_value_t = 1000)]
        iterations: u32,
    },
    /// Write live entries as JSON Lines
    Export {
        /// Only export this source
        #[arg(long)]
        source: Option<String>,
        /// Output file; stdout when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn print_report<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

async fn open(cli: &Cli) -> Result<CacheManager> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => {
            let mut config = CacheConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(path) = &cli.warm_path {
        config.warm.path.clone_from(path);
    }
    let path = config.warm.path.clone();
    CacheManager::builder()
        .with_config(config)
        .build()
        .await
        .with_context(|| format!("failed to open cache at {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cache = open(&cli).await?;

    match cli.command {
        Command::Inspect { source, limit } => print_report(&cache.inspect(&source, limit).await?),
        Command::ClearExpired => print_report(&cache.clear_expired().await?),
        Command::Purge { source, yes } => {
            if !yes {
                bail!("refusing to purge '{source}' without --yes");
            }
            print_report(&cache.purge_source_report(&source).await?)
        }
        Command::Stats => print_report(&cache.stats_report().await?),
        Command::Benchmark { iterations } => print_report(&cache.benchmark(iterations).await?),
        Command::Export { source, output } => {
            let report = match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    let report = cache.export(source.as_deref(), &mut file).await?;
                    file.sync_all().await?;
                    report
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    let report = cache.export(source.as_deref(), &mut stdout).await?;
                    stdout.flush().await?;
                    report
                }
            };
            tracing::info!(
                exported = report.exported,
                failures = report.decode_failures.len(),
                "Export complete"
            );
            Ok(())
        }
    }
}
