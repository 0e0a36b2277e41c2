//! # Harvest
//!
//! Incremental harvester for issue trackers and support forums.
//!
//! Harvest fetches records from remote sources through connectors, gives
//! every record a stable identity, keeps the raw responses in a local replay
//! cache, and upserts the wrapped records into an index store. Each pass
//! starts where the store says the previous one ended.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────────┐
//! │  Connectors  │──▶│   Feeder    │──▶│   Index store     │
//! │ Bugzilla /   │   │ boundary +  │   │ SQLite / Elastic  │
//! │ Kitsune      │   │ batching    │   └────────┬─────────┘
//! └──────┬───────┘   └─────────────┘            │
//!        │                                      ▼
//!        ▼                               ┌────────────┐
//! ┌──────────────┐                       │ ItemReader │
//! │ Replay cache │                       └────────────┘
//! └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                       # create the database
//! harvest sync bugzilla              # fetch what changed since the last pass
//! harvest sync kitsune --fetch-cache # replay the cache, no network
//! harvest items bugzilla:redhat      # dump stored records as JSON lines
//! harvest runs                       # show the run log
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`traits`] | Connector contract and registry |
//! | [`connector_bugzilla`] | Bugzilla connector |
//! | [`connector_kitsune`] | Kitsune connector |
//! | [`cache`] | Replay cache of raw responses |
//! | [`extract`] | XML, CSV and HTML payload parsing |
//! | [`http`] | Shared HTTP client with retries |
//! | [`ingest`] | Sync engine |
//! | [`sqlite_store`] | SQLite index store |
//! | [`elastic_store`] | Elasticsearch index store |
//! | [`runs`] | Run log |
//! | [`db`] | Database connection and store selection |
//! | [`migrate`] | Schema migrations |
//!
//! The identity scheme, record model, `IndexStore` trait and read-back
//! iterator live in the `harvest-core` crate.

pub mod cache;
pub mod cache_cmd;
pub mod config;
pub mod connector_bugzilla;
pub mod connector_kitsune;
pub mod db;
pub mod elastic_store;
pub mod extract;
pub mod http;
pub mod ingest;
pub mod items;
pub mod migrate;
pub mod progress;
pub mod runs;
pub mod sources;
pub mod sqlite_store;
pub mod traits;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber: `RUST_LOG` filtering (default
/// `info`), output on stderr.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
