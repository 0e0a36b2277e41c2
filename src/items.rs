//! `harvest items`: dump stored records as JSON lines.
//!
//! Reads through the index store's scroll cursor, one page at a time,
//! oldest `metadata__updated_on` first. Only the configuration is consulted
//! to resolve origins; sources are never contacted.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use harvest_core::models::FIELD_UPDATED_ON;
use harvest_core::reader::ItemReader;
use harvest_core::store::{ScanRequest, StoreFilter};

use crate::config::Config;
use crate::db;
use crate::http::HttpClient;

pub async fn run_items(
    config: &Config,
    spec: &str,
    from_date: Option<DateTime<Utc>>,
    page_size: Option<usize>,
) -> Result<u64> {
    let entries = config.connectors.select(spec)?;
    let http = HttpClient::from_config(&config.http)?;
    let store = db::open_index_store(config, &http).await?;
    let page_size = page_size.unwrap_or(config.store.scroll_page_size);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut total = 0u64;

    for entry in entries {
        let request = ScanRequest::new(FIELD_UPDATED_ON)
            .with_filter(StoreFilter::origin(&entry.origin))
            .with_from_date(from_date)
            .with_page_size(page_size);
        let mut reader = ItemReader::new(store.clone(), request);

        while let Some(doc) = reader.next().await {
            writeln!(out, "{}", doc)?;
            total += 1;
        }
    }
    out.flush()?;

    tracing::info!(spec, total, "items written");
    Ok(total)
}
