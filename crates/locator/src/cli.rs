//! Exposes the command line application.
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use locator_service::config::Config;
use locator_service::display::DisplayTable;
use locator_service::metrics;
use locator_service::persistence::storage_from_config;
use locator_service::remote::{ChannelLookup, RemoteLookup};
use locator_service::{LocationInfo, ResolverService};

use crate::logging;

/// Locator commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve keys given as arguments, or one per line on stdin.
    Resolve {
        /// The keys to resolve.
        keys: Vec<String>,

        /// Only answer from the cache, never contact the remote side.
        #[arg(long)]
        offline: bool,
    },

    /// Print the usage counts and the number of cached entries.
    Stats,

    /// Remove all cached answers and usage counts.
    ClearCache,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "locator", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// One line of `resolve` output.
#[derive(Debug, Serialize)]
struct ResolvedKey<'a> {
    key: &'a str,
    #[serde(flatten)]
    info: LocationInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Stats {
    cached: usize,
    counts: std::collections::BTreeMap<String, u64>,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let dsn = config
        .sentry_dsn
        .as_deref()
        .map(str::parse::<sentry::types::Dsn>)
        .transpose()
        .context("invalid sentry DSN")?;
    let _sentry = sentry::init(sentry::ClientOptions {
        dsn,
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime has not been started yet, so we are still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        if let Err(error) = metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        ) {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "Failed to configure statsd"
            );
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("locator")
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Command::Resolve { keys, offline } => resolve(&config, keys, offline).await,
            Command::Stats => stats(&config).await,
            Command::ClearCache => clear_cache(&config).await,
        }
    })
}

/// A lookup that nothing answers, for commands that must not contact the remote side.
fn detached_lookup() -> Arc<dyn RemoteLookup> {
    let (lookup, _requests, _responses) = ChannelLookup::new();
    Arc::new(lookup)
}

/// Creates a resolver that only serves what is cached.
async fn offline_service(config: &Config) -> ResolverService {
    let storage = storage_from_config(&config.persistence);
    let display = DisplayTable::new(config.display_names.clone());
    let service = ResolverService::new(config, detached_lookup(), storage, Arc::new(display)).await;
    service.set_enabled(false);
    service
}

fn read_keys(reader: impl BufRead) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read keys")?;
        let key = line.trim();
        if !key.is_empty() {
            keys.push(key.to_owned());
        }
    }
    Ok(keys)
}

async fn resolve(config: &Config, keys: Vec<String>, offline: bool) -> Result<()> {
    let keys = match keys.is_empty() {
        true => read_keys(std::io::stdin().lock())?,
        false => keys,
    };

    let service = match offline {
        true => offline_service(config).await,
        false => ResolverService::from_config(config).await?,
    };

    // Larger batches would only overflow the queue.
    let batch_size = config.queue.max_queue_size.max(1);
    for batch in keys.chunks(batch_size) {
        let results = service.resolve_many(batch).await;
        for (key, result) in batch.iter().zip(results) {
            let line = match result {
                Ok(info) => ResolvedKey {
                    key,
                    info,
                    error: None,
                },
                Err(error) => ResolvedKey {
                    key,
                    info: LocationInfo::default(),
                    error: Some(error.to_string()),
                },
            };
            println!("{}", serde_json::to_string(&line)?);
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn stats(config: &Config) -> Result<()> {
    let service = offline_service(config).await;
    let stats = Stats {
        cached: service.cache_len(),
        counts: service.counts(),
    };
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn clear_cache(config: &Config) -> Result<()> {
    let service = offline_service(config).await;
    let status = service.clear().await;
    tracing::info!(?status, "Cleared cache");
    Ok(())
}
