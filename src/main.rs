// src/main.rs

use anyhow::{Context, Result, bail};
use clap::Parser;
use debmirror::{CheckMode, DistOutcome, Mirror, MirrorConfig};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "debmirror")]
#[command(author, version, about = "Mirror Debian repositories with by-hash resolution and verified downloads", long_about = None)]
struct Cli {
    /// TOML config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Repository root (http(s):// URL, file:// URL or local path)
    #[arg(short, long)]
    source: Option<String>,

    /// Local mirror directory
    #[arg(short = 'p', long)]
    cache_path: Option<PathBuf>,

    /// How local files are compared: release-date (default), size, md5, sha1, sha256
    #[arg(short = 'm', long)]
    check_mode: Option<CheckMode>,

    /// Download ceiling in Mbit/s (0 = unlimited)
    #[arg(short, long)]
    bandwidth: Option<f64>,

    /// Distribution to mirror (repeatable or comma-separated)
    #[arg(short, long = "dist", value_delimiter = ',')]
    dists: Vec<String>,

    /// Architecture to mirror (repeatable or comma-separated); default: all listed
    #[arg(short, long = "arch", value_delimiter = ',')]
    arches: Vec<String>,

    /// Concurrent transfers (default: CPU count)
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<MirrorConfig> {
        let mut config = match &self.config {
            Some(path) => MirrorConfig::load(path)?,
            None => {
                let source = self.source.clone().context("--source is required without --config")?;
                let cache_path = self
                    .cache_path
                    .clone()
                    .context("--cache-path is required without --config")?;
                MirrorConfig::new(source, cache_path)
            }
        };

        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(cache_path) = self.cache_path {
            config.cache_path = cache_path;
        }
        if let Some(mode) = self.check_mode {
            config.check_mode = mode;
        }
        if let Some(bandwidth) = self.bandwidth {
            config.bandwidth_limit = bandwidth;
        }
        if !self.dists.is_empty() {
            config.distributions = self.dists;
        }
        if !self.arches.is_empty() {
            config.architectures = Some(self.arches);
        }
        if self.jobs.is_some() {
            config.concurrency = self.jobs;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.into_config()?;
    let mirror = Mirror::new(config)?;

    let token = mirror.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight transfers");
            token.cancel();
        }
    });

    let summary = mirror.run().await?;

    for (dist, outcome) in &summary.distributions {
        info!("{}: {:?}", dist, outcome);
    }

    if summary.has_aborted() {
        let aborted: Vec<&str> = summary
            .distributions
            .iter()
            .filter(|(_, outcome)| matches!(outcome, DistOutcome::Aborted(_)))
            .map(|(dist, _)| dist.as_str())
            .collect();
        bail!("Aborted on local I/O failure: {}", aborted.join(", "));
    }

    Ok(())
}
