//! # Harvest CLI (`harvest`)
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and its tables |
//! | `harvest sources` | List configured connectors and their caches |
//! | `harvest sync <connector>` | Run one incremental pass per selected connector |
//! | `harvest items <connector>` | Print stored records as JSON lines |
//! | `harvest cache <connector> <action>` | Back up, recover, or clean replay caches |
//! | `harvest runs` | Show the run log |
//!
//! ## Examples
//!
//! ```bash
//! # Everything that changed on every configured source
//! harvest sync all
//!
//! # One Bugzilla instance, re-reading from a fixed date
//! harvest sync bugzilla:redhat --from-date 2015-01-01
//!
//! # Rebuild the store from the cache without touching the network
//! harvest sync kitsune:sumo --fetch-cache
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use harvest::cache_cmd::{self, CacheAction};
use harvest::ingest::{self, SyncArgs};
use harvest::progress::ProgressMode;
use harvest::{config, items, migrate, runs, sources};
use harvest_core::time::str_to_datetime;
use std::path::PathBuf;

/// Harvest: incremental harvesting of issue trackers and forums into an
/// index store.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Incremental harvester for issue trackers and support forums",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/harvest.toml`. See
    /// `config/harvest.example.toml` for every setting.
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and its tables (items, scrolls,
    /// runs). Running it again is safe.
    Init,

    /// List configured connectors and the state of their caches.
    Sources,

    /// Run one harvesting pass per selected connector.
    ///
    /// Connector format: `all`, `<type>`, or `<type>:<name>`.
    Sync {
        /// Connector specifier, e.g. `all`, `bugzilla`, `kitsune:sumo`.
        connector: String,

        /// Fetch items updated on or after this date instead of the
        /// store's boundary (date connectors).
        #[arg(long)]
        from_date: Option<String>,

        /// Fetch items from this offset instead of the store's boundary
        /// (offset connectors).
        #[arg(long)]
        offset: Option<u64>,

        /// Replay the cache instead of fetching.
        #[arg(long)]
        fetch_cache: bool,

        /// Empty the cache before fetching (a snapshot is kept).
        #[arg(long)]
        clean_cache: bool,

        /// Do not write raw responses to the cache.
        #[arg(long)]
        no_cache: bool,

        /// Project tag stored with every record.
        #[arg(long)]
        project: Option<String>,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Print stored records as JSON lines, oldest update first.
    Items {
        /// Connector specifier whose origins to read.
        connector: String,

        /// Only records updated on or after this date.
        #[arg(long)]
        from_date: Option<String>,

        /// Documents fetched per scroll page.
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Manage replay caches.
    Cache {
        /// Connector specifier whose caches to touch.
        connector: String,

        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Show the most recent runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Snapshot the current cache contents.
    Backup,
    /// Restore the last snapshot.
    Recover,
    /// Discard the cache contents.
    Clean {
        /// Also skip the snapshot.
        #[arg(long)]
        erase: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn parse_date(raw: Option<String>) -> anyhow::Result<Option<chrono::DateTime<chrono::Utc>>> {
    raw.map(|s| str_to_datetime(&s).with_context(|| format!("Invalid --from-date '{}'", s)))
        .transpose()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    harvest::init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Sync {
            connector,
            from_date,
            offset,
            fetch_cache,
            clean_cache,
            no_cache,
            project,
            progress,
        } => {
            let args = SyncArgs {
                spec: connector,
                from_date: parse_date(from_date)?,
                offset,
                fetch_cache,
                clean_cache,
                no_cache,
                project,
            };
            let progress = progress.map_or_else(ProgressMode::default_for_tty, ProgressMode::from);
            ingest::run_sync(&cfg, &args, progress).await?;
        }
        Commands::Items {
            connector,
            from_date,
            page_size,
        } => {
            items::run_items(&cfg, &connector, parse_date(from_date)?, page_size).await?;
        }
        Commands::Cache { connector, action } => {
            let action = match action {
                CacheCommand::Backup => CacheAction::Backup,
                CacheCommand::Recover => CacheAction::Recover,
                CacheCommand::Clean { erase } => CacheAction::Clean { erase },
            };
            cache_cmd::run_cache(&cfg, &connector, action)?;
        }
        Commands::Runs { limit } => {
            runs::run_runs(&cfg, limit).await?;
        }
    }

    Ok(())
}
