//! Sync engine.
//!
//! One pass (`Feeder::feed`) moves a connector's records into an index
//! store:
//!
//! 1. work out where to start: a caller override, else the store's
//!    boundary for the connector's origin (latest `metadata__updated_on`,
//!    or latest `offset` + 1 for offset connectors), else the beginning
//! 2. pull records from the live source or from the replay cache
//! 3. tag each record with its stored dates and project, and apply the
//!    drop predicate
//! 4. write in batches of the store's bulk size
//!
//! A failing record aborts the pass. Batches already written stay written;
//! re-running is safe since writes are upserts by uuid.
//!
//! [`run_sync`] wraps passes for the CLI: cache backup before a live pass,
//! cache recovery when it fails, and an entry in the run log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use harvest_core::models::{FIELD_UPDATED_ON, FIELD_UUID};
use harvest_core::reader::ItemReader;
use harvest_core::store::{IndexStore, ScanRequest, StoreFilter};
use harvest_core::time::{epoch, to_iso};
use harvest_core::{Record, Result};
use serde_json::Value;

use crate::config::Config;
use crate::db;
use crate::http::HttpClient;
use crate::migrate;
use crate::progress::{NoProgress, ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::runs;
use crate::traits::{cached_records, records, Connector, ConnectorRegistry, FetchFrom, FetchMode};

/// Predicate marking records that must not be stored.
pub type DropItem = Box<dyn Fn(&Record) -> bool + Send + Sync>;

/// Options of one pass.
#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    /// Start date, overriding the store's boundary.
    pub from_date: Option<DateTime<Utc>>,
    /// Start offset, overriding the store's boundary.
    pub offset: Option<u64>,
    /// Replay the connector's cache instead of fetching.
    pub fetch_cache: bool,
    /// Tag stored with every record.
    pub project: Option<String>,
}

/// Outcome of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub connector: String,
    pub origin: String,
    /// Where the pass started; `None` for a cache replay.
    pub from: Option<FetchFrom>,
    pub fetched: u64,
    /// Records strictly newer than the start date.
    pub new_records: u64,
    pub dropped: u64,
    pub written: u64,
    pub batches: u64,
    pub elapsed: Duration,
}

impl SyncReport {
    fn new(connector: &dyn Connector) -> Self {
        Self {
            connector: connector.source_label(),
            origin: connector.origin().to_string(),
            from: None,
            fetched: 0,
            new_records: 0,
            dropped: 0,
            written: 0,
            batches: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Human-readable start point, as shown in summaries and the run log.
    pub fn boundary(&self) -> String {
        describe_start(self.from)
    }
}

pub fn describe_start(from: Option<FetchFrom>) -> String {
    match from {
        None => "cache".to_string(),
        Some(FetchFrom::Start) => "start".to_string(),
        Some(FetchFrom::Date(date)) => to_iso(&date),
        Some(FetchFrom::Offset(offset)) => format!("offset {}", offset),
    }
}

/// Drives one connector into one index store.
pub struct Feeder<'a> {
    connector: &'a dyn Connector,
    store: Arc<dyn IndexStore>,
    drop_item: Option<DropItem>,
    progress: Box<dyn SyncProgressReporter>,
    report: Option<SyncReport>,
}

impl<'a> Feeder<'a> {
    pub fn new(connector: &'a dyn Connector, store: Arc<dyn IndexStore>) -> Self {
        Self {
            connector,
            store,
            drop_item: None,
            progress: Box::new(NoProgress),
            report: None,
        }
    }

    pub fn with_drop_item(mut self, drop_item: DropItem) -> Self {
        self.drop_item = Some(drop_item);
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    fn origin_filter(&self) -> StoreFilter {
        StoreFilter::origin(self.connector.origin())
    }

    /// Where a live pass starts.
    pub async fn start_point(&self, options: &FeedOptions) -> FetchFrom {
        match self.connector.fetch_mode() {
            FetchMode::FromDate => {
                let date = match options.from_date {
                    Some(date) => Some(date),
                    None => {
                        self.store
                            .last_update(FIELD_UPDATED_ON, Some(&self.origin_filter()))
                            .await
                    }
                };
                FetchFrom::Date(date.unwrap_or_else(epoch))
            }
            FetchMode::FromOffset => {
                let offset = match options.offset {
                    Some(offset) => offset,
                    None => self
                        .store
                        .last_offset(Some(&self.origin_filter()))
                        .await
                        .map_or(0, |last| last + 1),
                };
                FetchFrom::Offset(offset)
            }
            FetchMode::Full => FetchFrom::Start,
        }
    }

    /// Run one pass.
    pub async fn feed(&mut self, options: &FeedOptions) -> Result<&mut Self> {
        let started = Instant::now();
        let mut report = SyncReport::new(self.connector);

        let mut items = if options.fetch_cache {
            cached_records(self.connector).await?
        } else {
            let from = self.start_point(options).await;
            report.from = Some(from);
            records(self.connector, from).await?
        };
        tracing::info!(
            connector = %report.connector,
            origin = %report.origin,
            from = %report.boundary(),
            "feeding"
        );
        self.progress.report(SyncProgressEvent::Fetching {
            connector: report.connector.clone(),
        });

        let bulk_size = self.store.bulk_size().max(1);
        let mut batch: Vec<Value> = Vec::with_capacity(bulk_size);

        while let Some(mut record) = items.next().await? {
            report.fetched += 1;
            match report.from {
                Some(FetchFrom::Date(from)) if record.updated_on <= from => {}
                _ => report.new_records += 1,
            }

            record.tag_stored_dates();
            if let Some(project) = &options.project {
                record.project = Some(project.clone());
            }
            if self.drop_item.as_ref().is_some_and(|drop| drop(&record)) {
                report.dropped += 1;
                continue;
            }

            batch.push(record.to_document()?);
            if batch.len() >= bulk_size {
                self.write_batch(&mut batch, &mut report).await?;
            }
        }
        self.write_batch(&mut batch, &mut report).await?;

        report.elapsed = started.elapsed();
        tracing::info!(
            connector = %report.connector,
            fetched = report.fetched,
            written = report.written,
            dropped = report.dropped,
            elapsed = ?report.elapsed,
            "feed completed"
        );
        self.report = Some(report);
        Ok(self)
    }

    async fn write_batch(&self, batch: &mut Vec<Value>, report: &mut SyncReport) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        report.written += self.store.bulk_upsert(batch, FIELD_UUID).await? as u64;
        report.batches += 1;
        batch.clear();
        self.progress.report(SyncProgressEvent::Writing {
            connector: report.connector.clone(),
            fetched: report.fetched,
            written: report.written,
        });
        Ok(())
    }

    /// Report of the last completed pass.
    pub fn report(&self) -> Option<&SyncReport> {
        self.report.as_ref()
    }

    /// Read back the connector's stored records, oldest update first.
    pub fn items(&self, from_date: Option<DateTime<Utc>>, page_size: usize) -> ItemReader {
        let request = ScanRequest::new(FIELD_UPDATED_ON)
            .with_filter(self.origin_filter())
            .with_from_date(from_date)
            .with_page_size(page_size);
        ItemReader::new(self.store.clone(), request)
    }
}

/// Arguments of `harvest sync`.
#[derive(Debug, Clone, Default)]
pub struct SyncArgs {
    pub spec: String,
    pub from_date: Option<DateTime<Utc>>,
    pub offset: Option<u64>,
    pub fetch_cache: bool,
    pub clean_cache: bool,
    pub no_cache: bool,
    pub project: Option<String>,
}

pub async fn run_sync(config: &Config, args: &SyncArgs, progress: ProgressMode) -> anyhow::Result<()> {
    if args.fetch_cache && args.no_cache {
        anyhow::bail!("--fetch-cache cannot be combined with --no-cache");
    }
    if args.fetch_cache && !config.cache.enabled {
        anyhow::bail!("--fetch-cache needs the cache; it is disabled in [cache]");
    }

    // Validate the selection before contacting any server.
    config.connectors.select(&args.spec)?;

    let http = HttpClient::from_config(&config.http)?;
    let registry = if args.fetch_cache {
        ConnectorRegistry::for_replay(config, &http).await?
    } else {
        let with_cache = config.cache.enabled && !args.no_cache;
        ConnectorRegistry::from_config(config, &http, with_cache).await?
    };
    let store = db::open_index_store(config, &http).await?;

    let pool = db::connect(config).await?;
    migrate::create_schema(&pool).await?;

    let options = FeedOptions {
        from_date: args.from_date,
        offset: args.offset,
        fetch_cache: args.fetch_cache,
        project: args.project.clone(),
    };

    let mut failures = Vec::new();
    for connector in registry.select(&args.spec)? {
        let label = connector.source_label();
        let mode = if args.fetch_cache { "cache" } else { "fetch" };
        let run_id = runs::start_run(&pool, &label, connector.origin(), mode).await?;

        if let Some(cache) = connector.cache() {
            if !args.fetch_cache {
                if args.clean_cache {
                    cache.clean(false)
                } else {
                    cache.backup()
                }
                .with_context(|| format!("Failed to prepare cache of {}", label))?;
            }
        }

        let mut feeder = Feeder::new(connector, store.clone()).with_progress(progress.reporter());
        match feeder.feed(&options).await {
            Ok(_) => {
                if let Some(report) = feeder.report() {
                    runs::finish_run(&pool, &run_id, Some(report), None).await?;
                    print_report(report);
                }
            }
            Err(e) => {
                tracing::error!(connector = %label, error = %e, "sync failed");
                if let Some(cache) = connector.cache() {
                    if !args.fetch_cache {
                        if let Err(re) = cache.recover() {
                            tracing::warn!(connector = %label, error = %re, "cannot recover cache");
                        }
                    }
                }
                runs::finish_run(&pool, &run_id, None, Some(&e.to_string())).await?;
                println!("sync {}", label);
                println!("  error: {}", e);
                failures.push(label);
            }
        }
    }

    pool.close().await;

    if !failures.is_empty() {
        anyhow::bail!("sync failed for: {}", failures.join(", "));
    }
    println!("ok");
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("sync {}", report.connector);
    println!("  origin: {}", report.origin);
    println!("  from: {}", report.boundary());
    println!("  fetched: {} items", report.fetched);
    println!("  new: {}", report.new_records);
    println!("  dropped: {}", report.dropped);
    println!("  written: {} ({} batches)", report.written, report.batches);
    println!("  elapsed: {:.2}s", report.elapsed.as_secs_f64());
}
