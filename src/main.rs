//! # playlist-etl CLI
//!
//! ## Usage
//!
//! ```bash
//! playlist-etl --config ./config/etl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `run` | Fetch, land, transform, publish and archive (the whole job) |
//! | `fetch` | Fetch the playlist and land the raw document in pending |
//! | `transform` | Build and publish tables from pending documents |
//! | `archive` | Move pending documents to processed |
//! | `pending` | List pending documents |
//! | `schedule` | Run the whole job at the configured interval |
//! | `completions <shell>` | Print shell completions |
//!
//! ## Local dry runs
//!
//! `--store memory` swaps S3 for an in-process store. Combine with
//! `--seed <dir>` to load local `*.json` files as pending documents and
//! `--dump <dir>` to write the resulting objects to disk:
//!
//! ```bash
//! playlist-etl --store memory --seed ./samples --dump ./out transform
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use playlist_etl::catalog::{PlaylistSource, SpotifyClient};
use playlist_etl::config::{self, Config};
use playlist_etl::pipeline::{self, Pipeline, Plan};
use playlist_etl::store::{MemoryStore, ObjectStore, S3Store};

/// Spotify playlist ETL: raw JSON to S3, album/artist/song tables as CSV.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "playlist-etl", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/etl.toml")]
    config: PathBuf,

    /// Object store backend.
    #[arg(long, global = true, value_enum, default_value_t = StoreKind::S3)]
    store: StoreKind,

    /// With `--store memory`: load `*.json` files from this directory as
    /// pending documents before the command runs.
    #[arg(long, global = true)]
    seed: Option<PathBuf>,

    /// With `--store memory`: write every stored object under this
    /// directory after the command runs.
    #[arg(long, global = true)]
    dump: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    S3,
    Memory,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole job once.
    Run,

    /// Fetch the playlist and store the raw document under the pending prefix.
    Fetch,

    /// Build the album, artist and song tables from every pending document
    /// and publish them. Pending documents are left in place.
    Transform,

    /// Move every pending document to the processed prefix.
    Archive,

    /// List pending documents.
    Pending,

    /// Run the whole job every `schedule.interval_secs` until interrupted.
    ///
    /// A failed run is logged and the loop waits for the next tick.
    Schedule,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(
            shell,
            &mut Cli::command(),
            "playlist-etl",
            &mut std::io::stdout(),
        );
        return Ok(ExitCode::SUCCESS);
    }

    let cfg = config::load_config(&cli.config)?;

    let memory = match cli.store {
        StoreKind::Memory => {
            let memory = Arc::new(MemoryStore::new());
            if let Some(ref dir) = cli.seed {
                let n = memory
                    .load_dir(dir, &cfg.storage.pending_prefix)
                    .with_context(|| format!("Failed to seed from {}", dir.display()))?;
                tracing::info!(count = n, dir = %dir.display(), "seeded memory store");
            }
            Some(memory)
        }
        StoreKind::S3 => {
            if cli.seed.is_some() || cli.dump.is_some() {
                anyhow::bail!("--seed and --dump require --store memory");
            }
            None
        }
    };
    let store: Arc<dyn ObjectStore> = match memory {
        Some(ref memory) => memory.clone() as Arc<dyn ObjectStore>,
        None => Arc::new(S3Store::from_config(&cfg.storage)?),
    };

    let code = match cli.command {
        Commands::Run => run_plan(&cfg, store, Plan::Full).await?,
        Commands::Fetch => run_plan(&cfg, store, Plan::Fetch).await?,
        Commands::Transform => run_plan(&cfg, store, Plan::Transform).await?,
        Commands::Archive => run_plan(&cfg, store, Plan::Archive).await?,
        Commands::Pending => {
            let keys = pipeline::pending_keys(store.as_ref(), &cfg.storage.pending_prefix).await?;
            for key in &keys {
                println!("{}", key);
            }
            println!("pending: {}", keys.len());
            ExitCode::SUCCESS
        }
        Commands::Schedule => {
            let source = catalog_source(&cfg)?;
            let pipeline = Pipeline::new(cfg.storage.clone(), store, Some(source));
            pipeline
                .run_forever(Duration::from_secs(cfg.schedule.interval_secs))
                .await?;
            ExitCode::SUCCESS
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    };

    if let (Some(memory), Some(dir)) = (memory, cli.dump) {
        let n = memory
            .dump_dir(&dir)
            .with_context(|| format!("Failed to dump to {}", dir.display()))?;
        println!("dumped {} objects to {}", n, dir.display());
    }

    Ok(code)
}

fn catalog_source(cfg: &Config) -> Result<Arc<dyn PlaylistSource>> {
    let client = SpotifyClient::new(&cfg.catalog).context("Failed to set up catalog client")?;
    Ok(Arc::new(client))
}

async fn run_plan(cfg: &Config, store: Arc<dyn ObjectStore>, plan: Plan) -> Result<ExitCode> {
    let source = if plan.needs_source() {
        Some(catalog_source(cfg)?)
    } else {
        None
    };
    let pipeline = Pipeline::new(cfg.storage.clone(), store, source);
    let report = pipeline.run(plan, Utc::now()).await;
    println!("{}", report);

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
