//! # meshstore
//!
//! Command line front end for a sync node: run sync rounds against an
//! authority, inspect the local store and rebuild chunked countries.

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use eyre::WrapErr;
use meshstore::{
    config::{ConfigBuilder, SyncConfiguration},
    logging,
    model::{Dataset, Record},
    sync::{InMemoryAuthority, SyncChannel, SyncTransport},
    utils::format_bytes,
    LocalStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meshstore", version, about = "Offline-first dataset sync node")]
struct Cli {
    /// TOML configuration file; `MESHSTORE_*` environment variables otherwise
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the store directory
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<String>,

    /// Override the authority URL
    #[arg(long, global = true, value_name = "URL")]
    authority: Option<String>,

    /// JSON log output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync round, or keep syncing with --watch
    Sync {
        country: String,
        #[arg(long)]
        watch: bool,
    },
    /// Show storage mode and sync cursor for a country
    Status { country: String },
    /// Rebuild a chunked country and verify its Merkle root
    Reconstruct { country: String },
    /// Remove datasets older than the configured age
    Clean,
    /// Storage usage per country
    Stats,
    /// Sync generated records against an in-process authority
    Demo {
        #[arg(default_value = "peru")]
        country: String,
        #[arg(long, default_value_t = 3000)]
        records: usize,
    },
}

fn load_config(cli: &Cli) -> eyre::Result<SyncConfiguration> {
    let mut config = match &cli.config {
        Some(path) => SyncConfiguration::from_file(path)
            .wrap_err_with(|| format!("loading {}", path.display()))?,
        None => SyncConfiguration::from_env()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.path = Some(dir.clone());
    }
    if let Some(url) = &cli.authority {
        config.sync.authority_url = url.clone();
    }
    if cli.json {
        config.logging.format = "json".to_string();
    }
    config.validate()?;
    Ok(config)
}

fn format_timestamp(ms: u64) -> String {
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(at) if ms > 0 => at.to_rfc3339(),
        _ => "never".to_string(),
    }
}

async fn run_demo(country: &str, records: usize) -> eyre::Result<()> {
    let config = ConfigBuilder::new().announce(true).build()?;
    let authority = Arc::new(InMemoryAuthority::new(config.chunking.chunk_size));
    let mut seed = Dataset::empty();
    for i in 0..records {
        seed.insert_record_if_absent(
            Record::new(format!("rec-{:05}", i), i as u64)
                .with_field("nombres", format!("Nombre {}", i))
                .with_field("apellidos", format!("Apellido {}", i))
                .with_field("edad", (i % 90) as u64),
        );
    }
    authority.seed(country, seed);

    let store = Arc::new(LocalStore::new(config.storage.clone()));
    let channel = SyncChannel::builder(config)
        .with_store(store.clone())
        .with_transport(authority.clone() as Arc<dyn SyncTransport>)
        .build()?;

    let dataset = channel.sync(country).await?;
    let mode = channel.storage_mode(country).await?;
    let held = store.list_chunk_ids(country).await?.len();
    println!(
        "synced {} records for {} ({} mode, {} chunks held locally)",
        dataset.record_count(),
        country,
        mode.as_str(),
        held
    );

    let rebuilt = channel.reconstruct(country).await?;
    println!(
        "reconstructed {} records: complete={} verified={} pulled={}",
        rebuilt.dataset.record_count(),
        rebuilt.complete,
        rebuilt.verified,
        rebuilt.pulled_chunks
    );
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init_from_config(&config.logging)?;
    info!(version = meshstore::VERSION, profile = meshstore::BUILD_PROFILE, "meshstore starting");

    match cli.command {
        Command::Demo { country, records } => run_demo(&country, records).await,
        Command::Sync { country, watch } => {
            let interval = config.sync_interval();
            let channel = Arc::new(SyncChannel::builder(config).build()?);
            if watch {
                let _listener = channel.spawn_tab_listener();
                let periodic = channel.spawn_periodic(&country, interval);
                tokio::signal::ctrl_c().await?;
                periodic.abort();
                channel.store().flush().await?;
                return Ok(());
            }
            let dataset = channel.sync(&country).await?;
            channel.store().flush().await?;
            println!("{}: {} records", country, dataset.record_count());
            Ok(())
        }
        Command::Status { country } => {
            let channel = SyncChannel::builder(config).build()?;
            let mode = channel.storage_mode(&country).await?;
            let last_sync = channel
                .store()
                .load_metadata::<u64>(&format!("last_sync_{}", country))
                .await?
                .unwrap_or(0);
            let dataset = channel.load(&country).await?;
            println!("country:      {}", country);
            println!("mode:         {}", mode.as_str());
            println!("records:      {}", dataset.record_count());
            println!("last sync:    {}", format_timestamp(last_sync));
            Ok(())
        }
        Command::Reconstruct { country } => {
            let channel = SyncChannel::builder(config).build()?;
            let rebuilt = channel.reconstruct(&country).await?;
            println!(
                "{}: {} records, complete={}, verified={}, refreshed={}, missing={}",
                country,
                rebuilt.dataset.record_count(),
                rebuilt.complete,
                rebuilt.verified,
                rebuilt.refreshed,
                rebuilt.missing.len()
            );
            Ok(())
        }
        Command::Clean => {
            let store = LocalStore::new(config.storage.clone());
            let removed = store.clean_expired().await?;
            store.flush().await?;
            println!("removed {} stale datasets", removed);
            Ok(())
        }
        Command::Stats => {
            let store = LocalStore::new(config.storage.clone());
            let health = store.init().await;
            if health.degraded {
                println!("warning: persistent store unavailable, showing temporary data only");
            }
            let stats = store.storage_stats().await?;
            for (country, records) in &stats.countries {
                println!("{:<16} {:>8} records", country, records);
            }
            println!("total records:  {}", stats.total_records);
            println!("total chunks:   {}", stats.total_chunks);
            if let Some(bytes) = stats.primary_bytes {
                println!("disk usage:     {}", format_bytes(bytes));
            }
            println!(
                "fallback usage: {} / {}",
                format_bytes(stats.fallback_bytes),
                format_bytes(stats.fallback_capacity_bytes)
            );
            Ok(())
        }
    }
}
